//! BLE Connection Module
//!
//! Owns the link to one shade motor. A [`GattSession`] runs as a single task
//! that holds the peripheral, the connection flag and the characteristic
//! cache; everything else talks to it through a cloneable [`SessionHandle`].
//! Requests are executed one at a time in submission order, and link events
//! from the transport are applied before the next request is looked at.
//!
//! Every operation lazily brings the session up (connect, then service and
//! characteristic discovery) and makes at most one attempt at each step. If a
//! step fails the operation fails; the caller decides when to try again.

use crate::domain::error::{DeviceError, TransportError};
use crate::domain::models::DeviceInformation;
use crate::infrastructure::bluetooth::protocol::{self, DEVICE_INFO_CHARACTERISTICS};
use crate::infrastructure::bluetooth::transport::{BlePeripheral, GattAttribute, LinkEvent};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound applied to connect, each discovery step, and every read/write.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

const REQUEST_QUEUE_DEPTH: usize = 16;

/// Single-byte values the session can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteField {
    BatteryLevel,
    CurrentPosition,
    TargetPosition,
}

impl ByteField {
    fn operation(self) -> &'static str {
        match self {
            Self::BatteryLevel => "read battery level",
            Self::CurrentPosition => "read current position",
            Self::TargetPosition => "read target position",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub connected: bool,
    pub initialized: bool,
}

#[derive(Debug)]
enum SessionRequest {
    EnsureReady {
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Read {
        field: ByteField,
        reply: oneshot::Sender<Result<u8, DeviceError>>,
    },
    SetTargetPosition {
        value: u8,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    StopMotor {
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Information {
        reply: oneshot::Sender<Result<DeviceInformation, DeviceError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Characteristic handles resolved for the current connection.
struct CharacteristicCache<C> {
    battery_level: C,
    motor_state: C,
    motor_target: C,
    motor_control: C,
    information: Vec<C>,
}

impl<C: GattAttribute> CharacteristicCache<C> {
    fn from_discovered(mut found: HashMap<Uuid, C>) -> Result<Self, DeviceError> {
        let mut take = |uuid: Uuid| {
            found.remove(&uuid).ok_or_else(|| {
                DeviceError::ProtocolMismatch(format!("characteristic {uuid} missing"))
            })
        };

        let information = DEVICE_INFO_CHARACTERISTICS
            .iter()
            .map(|uuid| take(*uuid))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            battery_level: take(protocol::BATTERY_LEVEL)?,
            motor_state: take(protocol::MOTOR_STATE)?,
            motor_target: take(protocol::MOTOR_TARGET)?,
            motor_control: take(protocol::MOTOR_CONTROL)?,
            information,
        })
    }

    fn byte_field(&self, field: ByteField) -> &C {
        match field {
            ByteField::BatteryLevel => &self.battery_level,
            ByteField::CurrentPosition => &self.motor_state,
            ByteField::TargetPosition => &self.motor_target,
        }
    }
}

/// Races `io` against `limit`. The losing I/O is dropped, not cancelled on the wire.
async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    io: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, DeviceError> {
    match timeout(limit, io).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(DeviceError::Io { operation, source }),
        Err(_) => Err(DeviceError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

/// Session state for one peripheral. Only ever touched by its own task.
pub struct GattSession<P: BlePeripheral> {
    peripheral: P,
    address: String,
    timeout: Duration,
    connected: bool,
    cache: Option<CharacteristicCache<P::Characteristic>>,
    link_events: broadcast::Receiver<LinkEvent>,
    link_open: bool,
}

impl<P: BlePeripheral> GattSession<P> {
    pub fn new(peripheral: P, timeout: Duration) -> Self {
        let address = peripheral.address();
        let link_events = peripheral.subscribe_link_events();
        Self {
            peripheral,
            address,
            timeout,
            connected: false,
            cache: None,
            link_events,
            link_open: true,
        }
    }

    /// Starts the session task. It ends when `cancel` fires or every handle is dropped.
    pub fn spawn(
        peripheral: P,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let session = Self::new(peripheral, timeout);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let handle = SessionHandle {
            requests: requests_tx,
            address: session.address.clone(),
        };
        let task = tokio::spawn(session.run(requests_rx, cancel));
        (handle, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SessionRequest>,
        cancel: CancellationToken,
    ) {
        debug!(address = %self.address, "GATT session started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.link_events.recv(), if self.link_open => {
                    self.on_link_event(event);
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.drain_link_events();
                    self.handle(request).await;
                }
            }
        }
        self.teardown().await;
        debug!(address = %self.address, "GATT session stopped");
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.connected,
            initialized: self.cache.is_some(),
        }
    }

    fn on_link_event(&mut self, event: Result<LinkEvent, RecvError>) {
        match event {
            Ok(LinkEvent::Disconnected) => self.invalidate("peripheral disconnected"),
            // Missed events may have included a disconnect.
            Err(RecvError::Lagged(_)) => self.invalidate("link events lagged"),
            Err(RecvError::Closed) => self.link_open = false,
        }
    }

    fn drain_link_events(&mut self) {
        while self.link_open {
            match self.link_events.try_recv() {
                Ok(LinkEvent::Disconnected) => self.invalidate("peripheral disconnected"),
                Err(TryRecvError::Lagged(_)) => self.invalidate("link events lagged"),
                Err(TryRecvError::Closed) => self.link_open = false,
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    /// Drops the connection flag and the characteristic cache together.
    fn invalidate(&mut self, reason: &str) {
        if self.connected || self.cache.is_some() {
            info!(address = %self.address, reason, "GATT session invalidated");
        }
        self.connected = false;
        self.cache = None;
    }

    async fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::EnsureReady { reply } => {
                let result = self.ensure_ready().await.map(|_| ());
                self.finish(reply, result).await;
            }
            SessionRequest::Read { field, reply } => {
                let result = self.read_byte(field).await;
                self.finish(reply, result).await;
            }
            SessionRequest::SetTargetPosition { value, reply } => {
                let result = self.write_target(value).await;
                self.finish(reply, result).await;
            }
            SessionRequest::StopMotor { reply } => {
                let result = self.stop_motor().await;
                self.finish(reply, result).await;
            }
            SessionRequest::Information { reply } => {
                let result = self.information().await;
                self.finish(reply, result).await;
            }
            SessionRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SessionRequest::Disconnect { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Replies, then abandons the link if the operation timed out on a live connection.
    async fn finish<T>(
        &mut self,
        reply: oneshot::Sender<Result<T, DeviceError>>,
        result: Result<T, DeviceError>,
    ) {
        let timed_out = matches!(&result, Err(e) if e.is_timeout());
        let _ = reply.send(result);
        if timed_out && self.connected {
            warn!(address = %self.address, "operation timed out, dropping link");
            self.teardown().await;
        }
    }

    async fn ensure_ready(
        &mut self,
    ) -> Result<&CharacteristicCache<P::Characteristic>, DeviceError> {
        if !self.connected {
            self.connect().await?;
        }
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => self.discover().await?,
        };
        let cache: &CharacteristicCache<P::Characteristic> = self.cache.insert(cache);
        Ok(cache)
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        debug!(address = %self.address, "connecting");
        match timeout(self.timeout, self.peripheral.connect()).await {
            Ok(Ok(())) => {
                info!(address = %self.address, "connected");
                self.connected = true;
                Ok(())
            }
            Ok(Err(e)) => Err(DeviceError::Connection {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DeviceError::Timeout {
                operation: "connect",
                timeout: self.timeout,
            }),
        }
    }

    /// Resolves every characteristic the protocol needs, validating the exact
    /// service and characteristic layout. Nothing is kept if any step fails.
    async fn discover(&self) -> Result<CharacteristicCache<P::Characteristic>, DeviceError> {
        let services = with_timeout(
            self.timeout,
            "discover services",
            self.peripheral.discover_services(&protocol::SERVICES),
        )
        .await?;
        let found: Vec<Uuid> = services.iter().map(GattAttribute::uuid).collect();
        protocol::validate_shape("services", &protocol::SERVICES, &found)?;

        let mut characteristics = HashMap::new();
        for service in &services {
            let expected = protocol::expected_characteristics(service.uuid());
            let discovered = with_timeout(
                self.timeout,
                "discover characteristics",
                self.peripheral.discover_characteristics(service, expected),
            )
            .await?;
            let found: Vec<Uuid> = discovered.iter().map(GattAttribute::uuid).collect();
            protocol::validate_shape("characteristics", expected, &found)?;
            characteristics.extend(discovered.into_iter().map(|c| (c.uuid(), c)));
        }

        let cache = CharacteristicCache::from_discovered(characteristics)?;
        info!(address = %self.address, "GATT services resolved");
        Ok(cache)
    }

    async fn read_byte(&mut self, field: ByteField) -> Result<u8, DeviceError> {
        let characteristic = self.ensure_ready().await?.byte_field(field).clone();
        let value = with_timeout(
            self.timeout,
            field.operation(),
            self.peripheral.read(&characteristic),
        )
        .await?;
        protocol::decode_byte(&value)
    }

    async fn write_target(&mut self, value: u8) -> Result<(), DeviceError> {
        let characteristic = self.ensure_ready().await?.motor_target.clone();
        debug!(address = %self.address, value, "writing motor target");
        with_timeout(
            self.timeout,
            "write target position",
            self.peripheral.write(&characteristic, &[value], false),
        )
        .await
    }

    async fn stop_motor(&mut self) -> Result<(), DeviceError> {
        let characteristic = self.ensure_ready().await?.motor_control.clone();
        with_timeout(
            self.timeout,
            "stop motor",
            self.peripheral
                .write(&characteristic, &[protocol::STOP_COMMAND], false),
        )
        .await
    }

    async fn information(&mut self) -> Result<DeviceInformation, DeviceError> {
        let characteristics = self.ensure_ready().await?.information.clone();
        let mut fields = Vec::with_capacity(characteristics.len());
        for characteristic in &characteristics {
            let text = match with_timeout(
                self.timeout,
                "read device information",
                self.peripheral.read(characteristic),
            )
            .await
            {
                Ok(value) => protocol::decode_text(&value),
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => {
                    debug!(
                        address = %self.address,
                        uuid = %characteristic.uuid(),
                        error = %e,
                        "information field unreadable"
                    );
                    protocol::decode_text(&[])
                }
            };
            fields.push(text);
        }

        let mut fields = fields.into_iter();
        let mut next = || fields.next().unwrap_or_else(|| protocol::decode_text(&[]));
        Ok(DeviceInformation {
            manufacturer: next(),
            serial_number: next(),
            hardware_revision: next(),
            firmware_revision: next(),
            software_revision: next(),
        })
    }

    async fn teardown(&mut self) {
        if self.connected {
            if let Err(e) =
                with_timeout(self.timeout, "disconnect", self.peripheral.disconnect()).await
            {
                debug!(address = %self.address, error = %e, "disconnect failed");
            }
        }
        self.invalidate("session closed");
    }
}

/// Cloneable entry point to a running [`GattSession`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    address: String,
}

impl SessionHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn closed(&self) -> DeviceError {
        DeviceError::Connection {
            address: self.address.clone(),
            reason: "session closed".to_string(),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, DeviceError>>) -> SessionRequest,
    ) -> Result<T, DeviceError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())?
    }

    /// Connects and resolves characteristics if that has not happened yet.
    pub async fn ensure_ready(&self) -> Result<(), DeviceError> {
        self.call(|reply| SessionRequest::EnsureReady { reply }).await
    }

    pub async fn battery_level(&self) -> Result<u8, DeviceError> {
        self.read(ByteField::BatteryLevel).await
    }

    /// Raw current position, device convention.
    pub async fn current_position(&self) -> Result<u8, DeviceError> {
        self.read(ByteField::CurrentPosition).await
    }

    /// Raw target position, device convention.
    pub async fn target_position(&self) -> Result<u8, DeviceError> {
        self.read(ByteField::TargetPosition).await
    }

    async fn read(&self, field: ByteField) -> Result<u8, DeviceError> {
        self.call(|reply| SessionRequest::Read { field, reply }).await
    }

    /// Fire-and-forget write of a device-convention target.
    pub async fn set_target_position(&self, value: u8) -> Result<(), DeviceError> {
        self.call(|reply| SessionRequest::SetTargetPosition { value, reply })
            .await
    }

    pub async fn stop_motor(&self) -> Result<(), DeviceError> {
        self.call(|reply| SessionRequest::StopMotor { reply }).await
    }

    pub async fn information(&self) -> Result<DeviceInformation, DeviceError> {
        self.call(|reply| SessionRequest::Information { reply }).await
    }

    /// Snapshot of the session flags; a stopped session reports all false.
    pub async fn status(&self) -> SessionStatus {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Status { reply })
            .await
            .is_err()
        {
            return SessionStatus::default();
        }
        response.await.unwrap_or_default()
    }

    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }
}
