//! BLE Transport Abstraction
//!
//! The capability set the rest of the crate consumes from a BLE stack. A
//! backend delivers asynchronous happenings (advertisements, radio power
//! changes, scan stops, link drops) as events on channels instead of
//! callbacks, so each consumer handles them in one serialized loop.
//!
//! Timeouts are not a backend concern: [`GattSession`] wraps every call.
//!
//! [`GattSession`]: super::connection::GattSession

use crate::domain::error::TransportError;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Adapter-level event stream.
#[derive(Debug)]
pub enum CentralEvent<P> {
    RadioStateChanged(RadioState),
    /// An advertisement was seen. Backends may report the same peripheral
    /// any number of times.
    Discovered(P),
    /// The scan ended without being asked to.
    ScanStopped,
}

/// Per-peripheral link event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected,
}

/// A discovered GATT service or characteristic handle.
pub trait GattAttribute: Clone + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;
}

#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    type Peripheral: BlePeripheral;

    async fn radio_state(&self) -> Result<RadioState, TransportError>;

    /// Attaches a listener. Dropping the receiver detaches it.
    async fn events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent<Self::Peripheral>>, TransportError>;

    /// Starts scanning; an empty filter means unfiltered.
    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BlePeripheral: Send + Sync + 'static {
    type Service: GattAttribute;
    type Characteristic: GattAttribute;

    /// Link-layer address as reported by the stack.
    fn address(&self) -> String;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Subscribes to unsolicited link events for this peripheral.
    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent>;

    async fn discover_services(&self, uuids: &[Uuid])
        -> Result<Vec<Self::Service>, TransportError>;

    async fn discover_characteristics(
        &self,
        service: &Self::Service,
        uuids: &[Uuid],
    ) -> Result<Vec<Self::Characteristic>, TransportError>;

    async fn read(&self, characteristic: &Self::Characteristic) -> Result<Vec<u8>, TransportError>;

    /// `with_response = false` is a fire-and-forget write.
    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;
}
