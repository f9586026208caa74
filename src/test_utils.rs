//! In-memory BLE stack and accessory host for unit tests.

use crate::domain::error::TransportError;
use crate::domain::host::AccessoryHost;
use crate::domain::models::{DeviceIdentity, ExposedValue};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BleCentral, BlePeripheral, CentralEvent, GattAttribute, LinkEvent, RadioState,
};
use crate::platform::reconciler::ShadeReconciler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeAttribute(pub Uuid);

impl GattAttribute for FakeAttribute {
    fn uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Default)]
struct PeripheralState {
    connected: bool,
    values: HashMap<Uuid, Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>, bool)>,
    missing: Vec<Uuid>,
    connects: usize,
    disconnects: usize,
    service_discoveries: usize,
    connect_delay: Duration,
    read_delay: Duration,
    fail_connect: bool,
    fail_writes: bool,
}

/// A shade motor that answers from a value table and records every write.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    address: String,
    state: Arc<Mutex<PeripheralState>>,
    link: broadcast::Sender<LinkEvent>,
}

impl FakePeripheral {
    pub fn new(address: &str) -> Self {
        let mut values = HashMap::new();
        values.insert(protocol::BATTERY_LEVEL, vec![100]);
        values.insert(protocol::MOTOR_STATE, vec![0]);
        values.insert(protocol::MOTOR_TARGET, vec![0]);
        values.insert(protocol::MANUFACTURER_NAME, b"Fake Motors".to_vec());
        values.insert(protocol::SERIAL_NUMBER, b"SN-0001".to_vec());
        values.insert(protocol::HARDWARE_REVISION, b"1.0".to_vec());
        values.insert(protocol::FIRMWARE_REVISION, b"2.1.0".to_vec());
        values.insert(protocol::SOFTWARE_REVISION, b"2.1.0".to_vec());

        let (link, _) = broadcast::channel(8);
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(PeripheralState {
                values,
                ..Default::default()
            })),
            link,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap()
    }

    pub fn set_value(&self, uuid: Uuid, value: &[u8]) {
        self.state().values.insert(uuid, value.to_vec());
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, bool)> {
        self.state().writes.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn service_discoveries(&self) -> usize {
        self.state().service_discoveries
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state().read_delay = delay;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn remove_characteristic(&self, uuid: Uuid) {
        self.state().missing.push(uuid);
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self) {
        self.state().connected = false;
        let _ = self.link.send(LinkEvent::Disconnected);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.state().connected {
            Ok(())
        } else {
            Err(TransportError::new("not connected"))
        }
    }
}

#[async_trait]
impl BlePeripheral for FakePeripheral {
    type Service = FakeAttribute;
    type Characteristic = FakeAttribute;

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let (delay, fail) = {
            let state = self.state();
            (state.connect_delay, state.fail_connect)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransportError::new("connection refused"));
        }
        let mut state = self.state();
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    async fn discover_services(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<FakeAttribute>, TransportError> {
        self.ensure_connected()?;
        self.state().service_discoveries += 1;
        Ok(protocol::SERVICES
            .iter()
            .filter(|uuid| uuids.contains(uuid))
            .map(|uuid| FakeAttribute(*uuid))
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &FakeAttribute,
        uuids: &[Uuid],
    ) -> Result<Vec<FakeAttribute>, TransportError> {
        self.ensure_connected()?;
        let missing = self.state().missing.clone();
        Ok(protocol::expected_characteristics(service.0)
            .iter()
            .filter(|uuid| uuids.contains(uuid) && !missing.contains(uuid))
            .map(|uuid| FakeAttribute(*uuid))
            .collect())
    }

    async fn read(&self, characteristic: &FakeAttribute) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let delay = self.state().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state()
            .values
            .get(&characteristic.0)
            .cloned()
            .ok_or_else(|| TransportError::new("no value"))
    }

    async fn write(
        &self,
        characteristic: &FakeAttribute,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut state = self.state();
        if state.fail_writes {
            return Err(TransportError::new("write rejected"));
        }
        state
            .writes
            .push((characteristic.0, data.to_vec(), with_response));
        if characteristic.0 == protocol::MOTOR_TARGET {
            state.values.insert(characteristic.0, data.to_vec());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CentralState {
    radio: RadioState,
    listener: Option<mpsc::UnboundedSender<CentralEvent<FakePeripheral>>>,
    pending: Vec<CentralEvent<FakePeripheral>>,
    scanning: bool,
    scan_starts: usize,
    scan_stops: usize,
    filters: Vec<Vec<Uuid>>,
}

/// Adapter whose events are queued by the test. Events emitted before a
/// listener attaches are delivered when it does.
#[derive(Debug)]
pub struct FakeCentral {
    state: Mutex<CentralState>,
}

impl FakeCentral {
    pub fn new(radio: RadioState) -> Self {
        Self {
            state: Mutex::new(CentralState {
                radio,
                listener: None,
                pending: Vec::new(),
                scanning: false,
                scan_starts: 0,
                scan_stops: 0,
                filters: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CentralState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: CentralEvent<FakePeripheral>) {
        let mut state = self.state();
        if let CentralEvent::RadioStateChanged(radio) = &event {
            state.radio = *radio;
        }
        if let CentralEvent::ScanStopped = &event {
            state.scanning = false;
        }
        let event = match &state.listener {
            Some(listener) => match listener.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        state.pending.push(event);
    }

    pub fn scan_starts(&self) -> usize {
        self.state().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state().scan_stops
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    pub fn filters(&self) -> Vec<Vec<Uuid>> {
        self.state().filters.clone()
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    type Peripheral = FakePeripheral;

    async fn radio_state(&self) -> Result<RadioState, TransportError> {
        Ok(self.state().radio)
    }

    async fn events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent<FakePeripheral>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for event in state.pending.drain(..) {
            let _ = tx.send(event);
        }
        state.listener = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.radio != RadioState::PoweredOn {
            return Err(TransportError::new("radio is not powered on"));
        }
        state.scanning = true;
        state.scan_starts += 1;
        state.filters.push(service_filter.to_vec());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.scanning = false;
        state.scan_stops += 1;
        Ok(())
    }
}

/// Accessory host that remembers everything it was told.
#[derive(Default)]
pub struct RecordingHost {
    cached: Mutex<Vec<DeviceIdentity>>,
    registered: Mutex<Vec<DeviceIdentity>>,
    unregistered: Mutex<Vec<DeviceIdentity>>,
    updates: Mutex<Vec<(String, ExposedValue)>>,
    controllers: Mutex<Vec<ShadeReconciler>>,
}

impl RecordingHost {
    pub fn with_cached(cached: Vec<DeviceIdentity>) -> Self {
        Self {
            cached: Mutex::new(cached),
            ..Default::default()
        }
    }

    pub fn registered(&self) -> Vec<DeviceIdentity> {
        self.registered.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<DeviceIdentity> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(String, ExposedValue)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn clear_updates(&self) {
        self.updates.lock().unwrap().clear();
    }

    /// Most recent value pushed for `name` that `select` accepts.
    pub fn last<T>(&self, name: &str, select: impl Fn(&ExposedValue) -> Option<T>) -> Option<T> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|(device, _)| device == name)
            .find_map(|(_, value)| select(value))
    }

    pub fn controllers(&self) -> Vec<ShadeReconciler> {
        self.controllers.lock().unwrap().clone()
    }
}

impl AccessoryHost for RecordingHost {
    fn cached_accessories(&self) -> Vec<DeviceIdentity> {
        self.cached.lock().unwrap().clone()
    }

    fn restore_cached_accessory(&self, identity: &DeviceIdentity) -> Option<DeviceIdentity> {
        self.cached
            .lock()
            .unwrap()
            .iter()
            .find(|cached| *cached == identity)
            .cloned()
    }

    fn register_accessory(&self, identity: &DeviceIdentity) {
        self.registered.lock().unwrap().push(identity.clone());
    }

    fn unregister_accessories(&self, identities: &[DeviceIdentity]) {
        self.unregistered
            .lock()
            .unwrap()
            .extend(identities.iter().cloned());
    }

    fn update_value(&self, identity: &DeviceIdentity, value: ExposedValue) {
        self.updates
            .lock()
            .unwrap()
            .push((identity.name.clone(), value));
    }

    fn bind_controller(&self, _identity: &DeviceIdentity, controller: ShadeReconciler) {
        self.controllers.lock().unwrap().push(controller);
    }
}
