//! btleplug Backend
//!
//! Cross-platform [`BleCentral`] for Linux and macOS. Link drops are picked
//! up by one watcher task on the adapter event stream and fanned out to the
//! peripheral they belong to.

use crate::domain::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    BleCentral, BlePeripheral, CentralEvent, GattAttribute, LinkEvent, RadioState,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as AdapterEvent, CentralState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::new(e.to_string())
    }
}

impl GattAttribute for Service {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl GattAttribute for Characteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

fn map_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

type LinkMap = Arc<Mutex<HashMap<PeripheralId, broadcast::Sender<LinkEvent>>>>;

fn link_sender(links: &LinkMap, id: &PeripheralId) -> broadcast::Sender<LinkEvent> {
    links
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .entry(id.clone())
        .or_insert_with(|| broadcast::channel(8).0)
        .clone()
}

/// First Bluetooth adapter reported by the OS
pub struct BtleplugCentral {
    adapter: Adapter,
    links: LinkMap,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("no Bluetooth adapter found"))?;
        info!(adapter = %adapter.adapter_info().await?, "using Bluetooth adapter");

        let links = LinkMap::default();
        let mut events = adapter.events().await?;
        let watched = links.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceDisconnected(id) = event {
                    debug!(?id, "peripheral disconnected");
                    let _ = link_sender(&watched, &id).send(LinkEvent::Disconnected);
                }
            }
        });

        Ok(Self { adapter, links })
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    type Peripheral = BtleplugPeripheral;

    async fn radio_state(&self) -> Result<RadioState, TransportError> {
        Ok(map_state(self.adapter.adapter_state().await?))
    }

    async fn events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent<BtleplugPeripheral>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let links = self.links.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = match event {
                    AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => {
                        match adapter.peripheral(&id).await {
                            Ok(peripheral) => CentralEvent::Discovered(BtleplugPeripheral {
                                link: link_sender(&links, &id),
                                peripheral,
                            }),
                            Err(e) => {
                                debug!(?id, error = %e, "discovered peripheral vanished");
                                continue;
                            }
                        }
                    }
                    AdapterEvent::StateUpdate(state) => {
                        CentralEvent::RadioStateChanged(map_state(state))
                    }
                    _ => continue,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<(), TransportError> {
        let filter = ScanFilter {
            services: service_filter.to_vec(),
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "failed to stop scan cleanly");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct BtleplugPeripheral {
    peripheral: Peripheral,
    link: broadcast::Sender<LinkEvent>,
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    type Service = Service;
    type Characteristic = Characteristic;

    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<Service>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .filter(|service| uuids.contains(&service.uuid))
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &Service,
        uuids: &[Uuid],
    ) -> Result<Vec<Characteristic>, TransportError> {
        Ok(service
            .characteristics
            .iter()
            .filter(|characteristic| uuids.contains(&characteristic.uuid))
            .cloned()
            .collect())
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, TransportError> {
        Ok(self.peripheral.read(characteristic).await?)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(characteristic, data, write_type).await?;
        Ok(())
    }
}
