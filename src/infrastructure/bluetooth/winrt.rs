//! WinRT Backend
//!
//! [`BleCentral`] and [`BlePeripheral`] on top of the Windows Bluetooth LE
//! APIs. Advertisements come from a `BluetoothLEAdvertisementWatcher`, the
//! radio power state from `Windows.Devices.Radios`, and each peripheral keeps
//! a `GattSession` with `MaintainConnection` set while connected.

use crate::domain::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    BleCentral, BlePeripheral, CentralEvent, GattAttribute, LinkEvent, RadioState,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{IInspectable, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCommunicationStatus, GattDeviceService,
    GattSession as WinGattSession, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Radios::{Radio, RadioKind, RadioState as WinRadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::new(e.to_string())
    }
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

/// Formats a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`.
fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn check(status: GattCommunicationStatus, operation: &str) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::new(format!("{operation} failed: {status:?}")))
    }
}

fn map_radio_state(state: WinRadioState) -> RadioState {
    match state {
        WinRadioState::On => RadioState::PoweredOn,
        WinRadioState::Off | WinRadioState::Disabled => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

type Listener = Option<mpsc::UnboundedSender<CentralEvent<WinRtPeripheral>>>;

/// State shared with the WinRT event handlers.
#[derive(Default)]
struct Shared {
    listener: Mutex<Listener>,
    filter: Mutex<Vec<GUID>>,
    stop_requested: AtomicBool,
}

impl Shared {
    fn listener(&self) -> MutexGuard<'_, Listener> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: CentralEvent<WinRtPeripheral>) {
        if let Some(listener) = self.listener().as_ref() {
            let _ = listener.send(event);
        }
    }

    fn matches_filter(
        &self,
        args: &BluetoothLEAdvertisementReceivedEventArgs,
    ) -> windows::core::Result<bool> {
        let filter = self
            .filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if filter.is_empty() {
            return Ok(true);
        }
        let service_uuids = args.Advertisement()?.ServiceUuids()?;
        for i in 0..service_uuids.Size()? {
            if filter.contains(&service_uuids.GetAt(i)?) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Windows Bluetooth adapter
pub struct WinRtCentral {
    watcher: BluetoothLEAdvertisementWatcher,
    radio: Option<Radio>,
    shared: Arc<Shared>,
}

impl WinRtCentral {
    pub async fn new() -> Result<Self, TransportError> {
        let shared = Arc::new(Shared::default());

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let received = shared.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if received.matches_filter(args)? {
                        let peripheral = WinRtPeripheral::new(args.BluetoothAddress()?);
                        received.emit(CentralEvent::Discovered(peripheral));
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&handler)?;

        let stopped = shared.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if stopped.stop_requested.swap(false, Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(args) = args.as_ref() {
                    warn!(error = ?args.Error()?, "advertisement watcher stopped");
                }
                stopped.emit(CentralEvent::ScanStopped);
                Ok(())
            },
        );
        watcher.Stopped(&handler)?;

        let radio = Self::find_radio().await?;
        match &radio {
            Some(radio) => {
                let changed = shared.clone();
                let handler = TypedEventHandler::new(
                    move |radio: windows::core::Ref<Radio>, _: windows::core::Ref<IInspectable>| {
                        if let Some(radio) = radio.as_ref() {
                            let state = map_radio_state(radio.State()?);
                            info!(?state, "Bluetooth radio state changed");
                            changed.emit(CentralEvent::RadioStateChanged(state));
                        }
                        Ok(())
                    },
                );
                radio.StateChanged(&handler)?;
            }
            None => warn!("no Bluetooth radio found"),
        }

        Ok(Self {
            watcher,
            radio,
            shared,
        })
    }

    async fn find_radio() -> Result<Option<Radio>, TransportError> {
        let radios = Radio::GetRadiosAsync()?.await?;
        for i in 0..radios.Size()? {
            let radio = radios.GetAt(i)?;
            if radio.Kind()? == RadioKind::Bluetooth {
                return Ok(Some(radio));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BleCentral for WinRtCentral {
    type Peripheral = WinRtPeripheral;

    async fn radio_state(&self) -> Result<RadioState, TransportError> {
        match &self.radio {
            Some(radio) => Ok(map_radio_state(radio.State()?)),
            None => Ok(RadioState::Unsupported),
        }
    }

    async fn events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent<WinRtPeripheral>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.listener() = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<(), TransportError> {
        *self
            .shared
            .filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            service_filter.iter().copied().map(to_guid).collect();
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.watcher.Start()?;
        debug!("advertisement watcher started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.watcher.Stop()?;
        debug!("advertisement watcher stopped");
        Ok(())
    }
}

#[derive(Clone)]
pub struct WinRtService {
    uuid: Uuid,
    service: GattDeviceService,
}

impl GattAttribute for WinRtService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

#[derive(Clone)]
pub struct WinRtCharacteristic {
    uuid: Uuid,
    characteristic: GattCharacteristic,
}

impl GattAttribute for WinRtCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

struct Link {
    device: BluetoothLEDevice,
    session: WinGattSession,
    status_token: i64,
}

impl Link {
    fn close(self) -> Result<(), TransportError> {
        self.device.RemoveConnectionStatusChanged(self.status_token)?;
        self.session.Close()?;
        self.device.Close()?;
        Ok(())
    }
}

/// A shade seen in an advertisement, addressed by its 48-bit Bluetooth address
#[derive(Clone)]
pub struct WinRtPeripheral {
    address: u64,
    link: Arc<Mutex<Option<Link>>>,
    events: broadcast::Sender<LinkEvent>,
}

impl WinRtPeripheral {
    fn new(address: u64) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            address,
            link: Arc::new(Mutex::new(None)),
            events,
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self) -> Result<BluetoothLEDevice, TransportError> {
        self.link()
            .as_ref()
            .map(|link| link.device.clone())
            .ok_or_else(|| TransportError::new("not connected"))
    }
}

#[async_trait]
impl BlePeripheral for WinRtPeripheral {
    type Service = WinRtService;
    type Characteristic = WinRtCharacteristic;

    fn address(&self) -> String {
        format_address(self.address)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        // A link dropped by the device is still open on our side.
        let previous = self.link().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                debug!(address = %self.address(), error = %e, "failed to close stale link");
            }
        }

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.address)?.await?;
        let device_id = device.BluetoothDeviceId()?;
        let session = WinGattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;

        let events = self.events.clone();
        let handler = TypedEventHandler::new(
            move |device: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(device) = device.as_ref() {
                    if device.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = events.send(LinkEvent::Disconnected);
                    }
                }
                Ok(())
            },
        );
        let status_token = device.ConnectionStatusChanged(&handler)?;

        *self.link() = Some(Link {
            device,
            session,
            status_token,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = self.link().take();
        match link {
            Some(link) => link.close(),
            None => Ok(()),
        }
    }

    fn subscribe_link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<WinRtService>, TransportError> {
        let device = self.device()?;
        let mut found = Vec::new();
        for uuid in uuids {
            let result = device
                .GetGattServicesForUuidWithCacheModeAsync(
                    to_guid(*uuid),
                    BluetoothCacheMode::Uncached,
                )?
                .await?;
            check(result.Status()?, "service discovery")?;
            let services = result.Services()?;
            for i in 0..services.Size()? {
                let service = services.GetAt(i)?;
                found.push(WinRtService {
                    uuid: to_uuid(service.Uuid()?),
                    service,
                });
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        service: &WinRtService,
        uuids: &[Uuid],
    ) -> Result<Vec<WinRtCharacteristic>, TransportError> {
        let mut found = Vec::new();
        for uuid in uuids {
            let result = service
                .service
                .GetCharacteristicsForUuidWithCacheModeAsync(
                    to_guid(*uuid),
                    BluetoothCacheMode::Uncached,
                )?
                .await?;
            check(result.Status()?, "characteristic discovery")?;
            let characteristics = result.Characteristics()?;
            for i in 0..characteristics.Size()? {
                let characteristic = characteristics.GetAt(i)?;
                found.push(WinRtCharacteristic {
                    uuid: to_uuid(characteristic.Uuid()?),
                    characteristic,
                });
            }
        }
        Ok(found)
    }

    async fn read(&self, characteristic: &WinRtCharacteristic) -> Result<Vec<u8>, TransportError> {
        let result = characteristic
            .characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check(result.Status()?, "read")?;
        let buffer = result.Value()?;
        let reader = DataReader::FromBuffer(&buffer)?;
        let mut bytes = vec![0u8; buffer.Length()? as usize];
        reader.ReadBytes(&mut bytes)?;
        Ok(bytes)
    }

    async fn write(
        &self,
        characteristic: &WinRtCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(data)?;
        let buffer = writer.DetachBuffer()?;
        let option = if with_response {
            GattWriteOption::WriteWithResponse
        } else {
            GattWriteOption::WriteWithoutResponse
        };
        let status = characteristic
            .characteristic
            .WriteValueWithOptionAsync(&buffer, option)?
            .await?;
        check(status, "write")
    }
}
