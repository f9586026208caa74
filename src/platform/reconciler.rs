//! Per-shade reconciliation loop.
//!
//! Polls the motor through its [`SessionHandle`], translates device values into
//! host convention and pushes them to the [`AccessoryHost`]. Host commands run
//! on the caller's task and share the state below with the poll loop.

use crate::domain::error::CommandError;
use crate::domain::host::AccessoryHost;
use crate::domain::models::{
    BatteryState, DeviceIdentity, ExposedValue, PositionState, ShadeState,
};
use crate::domain::position::{self, LOW_BATTERY_THRESHOLD, MAX_POSITION};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::SessionHandle;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub tolerance: u8,
    pub low_battery_threshold: u8,
    /// Minimum spacing between accepted move commands.
    pub command_throttle: Duration,
    /// `None` lets a movement stay in flight indefinitely.
    pub stall_timeout: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            tolerance: position::DEFAULT_TOLERANCE,
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            command_throttle: Duration::from_secs(1),
            stall_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl From<&Settings> for ReconcilerConfig {
    fn from(settings: &Settings) -> Self {
        let stall = settings.stall_timeout();
        Self {
            poll_interval: settings.poll_interval(),
            tolerance: settings.movement_tolerance,
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            command_throttle: settings.command_throttle(),
            stall_timeout: (!stall.is_zero()).then_some(stall),
        }
    }
}

#[derive(Debug, Default)]
struct ReconcilerState {
    shade: ShadeState,
    battery: BatteryState,
    position_known: bool,
    target_adopted: bool,
    information_published: bool,
    last_command: Option<Instant>,
    movement_started: Option<Instant>,
    anomaly_seen: bool,
}

impl ReconcilerState {
    fn settle(&mut self) {
        self.shade.position_state = PositionState::Stopped;
        self.shade.movement_in_flight = false;
        self.movement_started = None;
        self.anomaly_seen = false;
    }
}

struct Inner {
    identity: DeviceIdentity,
    session: SessionHandle,
    host: Arc<dyn AccessoryHost>,
    config: ReconcilerConfig,
    state: Mutex<ReconcilerState>,
}

/// Keeps one shade's host-facing state in step with the motor.
#[derive(Clone)]
pub struct ShadeReconciler {
    inner: Arc<Inner>,
}

impl ShadeReconciler {
    pub fn new(
        identity: DeviceIdentity,
        session: SessionHandle,
        host: Arc<dyn AccessoryHost>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                session,
                host,
                config,
                state: Mutex::new(ReconcilerState::default()),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn shade_state(&self) -> ShadeState {
        self.state().shade
    }

    pub fn battery_state(&self) -> BatteryState {
        self.state().battery
    }

    // A poisoned lock only means a panicking test thread; the plain data inside
    // is still consistent.
    fn state(&self) -> MutexGuard<'_, ReconcilerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, values: Vec<ExposedValue>) {
        for value in values {
            self.inner.host.update_value(&self.inner.identity, value);
        }
    }

    fn device_name(&self) -> &str {
        &self.inner.identity.name
    }

    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel).await })
    }

    /// Polls immediately, then every `poll_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(device = %self.device_name(), "reconciler started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }
        info!(device = %self.device_name(), "reconciler stopped");
    }

    /// One poll cycle. Failures are logged and leave the affected fields as
    /// they were.
    pub async fn poll_once(&self) {
        let session = &self.inner.session;
        let device = self.device_name();

        if let Err(e) = session.ensure_ready().await {
            warn!(device, error = %e, "device not ready, skipping poll");
            return;
        }

        if !self.state().information_published {
            match session.information().await {
                Ok(information) => {
                    self.state().information_published = true;
                    self.push(vec![ExposedValue::Information(information)]);
                }
                Err(e) => warn!(device, error = %e, "failed to read device information"),
            }
        }

        match session.battery_level().await {
            Ok(level) => {
                let threshold = self.inner.config.low_battery_threshold;
                let battery = BatteryState::from_level(level, threshold);
                self.state().battery = battery;
                if battery.low {
                    debug!(device, level = battery.level, "battery low");
                }
                self.push(vec![
                    ExposedValue::BatteryLevel(battery.level),
                    ExposedValue::StatusLowBattery(battery.low),
                ]);
            }
            Err(e) => warn!(device, error = %e, "failed to read battery level"),
        }

        match session.current_position().await {
            Ok(raw) => {
                let current = position::invert(raw);
                {
                    let mut state = self.state();
                    state.shade.current_position = current;
                    state.position_known = true;
                }
                self.push(vec![ExposedValue::CurrentPosition(current)]);
            }
            Err(e) => warn!(device, error = %e, "failed to read current position"),
        }

        match session.target_position().await {
            Ok(raw) => {
                let target = position::invert(raw);
                let adopted = {
                    let mut state = self.state();
                    let first = !state.target_adopted;
                    if first {
                        state.shade.target_position = target;
                        state.target_adopted = true;
                    }
                    first
                };
                if adopted {
                    self.push(vec![ExposedValue::TargetPosition(target)]);
                }
            }
            Err(e) => warn!(device, error = %e, "failed to read target position"),
        }

        let updates = self.converge();
        self.push(updates);
    }

    /// Settles a finished, stalled or inconsistent movement.
    fn converge(&self) -> Vec<ExposedValue> {
        let device = self.device_name();
        let config = &self.inner.config;
        let mut state = self.state();
        let mut updates = Vec::new();

        if state.shade.position_state != PositionState::Stopped {
            let shade = state.shade;
            let stalled = match (config.stall_timeout, state.movement_started) {
                (Some(limit), Some(started)) => started.elapsed() >= limit,
                _ => false,
            };

            let (current, target) = (shade.current_position, shade.target_position);
            if position::done_moving(current, target, config.tolerance) {
                info!(device, position = shade.current_position, "movement complete");
                state.settle();
                updates.push(ExposedValue::PositionState(PositionState::Stopped));
            } else if stalled {
                warn!(
                    device,
                    current = shade.current_position,
                    target = shade.target_position,
                    "movement stalled, giving up on target"
                );
                state.shade.target_position = shade.current_position;
                state.settle();
                updates.push(ExposedValue::TargetPosition(shade.current_position));
                updates.push(ExposedValue::PositionState(PositionState::Stopped));
            }
        }

        if state.shade.is_inconsistent() {
            let shade = state.shade;
            if state.anomaly_seen {
                warn!(device, ?shade, "shade state still inconsistent, forcing stop");
                state.settle();
                updates.push(ExposedValue::PositionState(PositionState::Stopped));
            } else {
                warn!(device, ?shade, "shade state inconsistent");
                state.anomaly_seen = true;
            }
        } else {
            state.anomaly_seen = false;
        }

        updates
    }

    /// Moves the shade to `value` (host convention).
    ///
    /// Returns success without touching the device when the shade is already
    /// there, a movement is in flight, or the last command was too recent.
    /// Fails until a poll has read the shade's position.
    pub async fn set_target_position(&self, value: u8) -> Result<(), CommandError> {
        if value > MAX_POSITION {
            return Err(CommandError::OutOfRange(value));
        }
        let device = self.device_name();
        let now = Instant::now();

        let (direction, previous_target) = {
            let mut state = self.state();
            if !state.position_known {
                return Err(CommandError::NotReady(device.to_string()));
            }
            if value == state.shade.current_position {
                debug!(device, value, "already at requested position");
                return Ok(());
            }
            if state.shade.movement_in_flight {
                debug!(device, value, "movement in flight, ignoring command");
                return Ok(());
            }
            let throttled = state
                .last_command
                .is_some_and(|last| now.duration_since(last) < self.inner.config.command_throttle);
            if throttled {
                debug!(device, value, "command throttled");
                return Ok(());
            }

            let direction = position::direction(state.shade.current_position, value);
            let previous_target = state.shade.target_position;
            state.shade.target_position = value;
            state.shade.position_state = direction;
            state.shade.movement_in_flight = true;
            state.last_command = Some(now);
            state.movement_started = Some(now);
            state.anomaly_seen = false;
            (direction, previous_target)
        };
        info!(device, value, ?direction, "moving shade");
        self.push(vec![
            ExposedValue::TargetPosition(value),
            ExposedValue::PositionState(direction),
        ]);

        let session = &self.inner.session;
        let device_value = position::invert(value);
        let result = async {
            let device_target = session.target_position().await?;
            if device_target == device_value {
                debug!(device, value, "device already targeting value, skipping write");
                return Ok(());
            }
            session.set_target_position(device_value).await
        }
        .await;

        if let Err(e) = result {
            warn!(device, value, error = %e, "failed to set target position");
            {
                let mut state = self.state();
                state.shade.target_position = previous_target;
                state.settle();
            }
            self.push(vec![
                ExposedValue::TargetPosition(previous_target),
                ExposedValue::PositionState(PositionState::Stopped),
            ]);
            return Err(CommandError::Device {
                device: device.to_string(),
                source: e,
            });
        }
        Ok(())
    }

    /// Halts the motor and adopts wherever it stopped as the new target.
    pub async fn stop(&self) -> Result<(), CommandError> {
        let session = &self.inner.session;
        let device = self.device_name();

        session.stop_motor().await.map_err(|e| CommandError::Device {
            device: device.to_string(),
            source: e,
        })?;
        info!(device, "motor stopped");

        let measured = match session.current_position().await {
            Ok(raw) => Some(position::invert(raw)),
            Err(e) => {
                warn!(device, error = %e, "failed to read position after stop");
                None
            }
        };

        let current = {
            let mut state = self.state();
            let current = measured.unwrap_or(state.shade.current_position);
            state.shade.current_position = current;
            state.shade.target_position = current;
            state.settle();
            current
        };
        self.push(vec![
            ExposedValue::CurrentPosition(current),
            ExposedValue::TargetPosition(current),
            ExposedValue::PositionState(PositionState::Stopped),
        ]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connection::GattSession;
    use crate::infrastructure::bluetooth::protocol;
    use crate::test_utils::{FakePeripheral, RecordingHost};

    struct Harness {
        peripheral: FakePeripheral,
        host: Arc<RecordingHost>,
        reconciler: ShadeReconciler,
        _cancel: CancellationToken,
    }

    fn harness(config: ReconcilerConfig) -> Harness {
        let peripheral = FakePeripheral::new("AA:BB:CC:DD:EE:FF");
        let cancel = CancellationToken::new();
        let (session, _task) =
            GattSession::spawn(peripheral.clone(), Duration::from_secs(10), cancel.clone());
        let host = Arc::new(RecordingHost::default());
        let reconciler = ShadeReconciler::new(
            DeviceIdentity::new("Balcony", "AA:BB:CC:DD:EE:FF"),
            session,
            host.clone(),
            config,
        );
        Harness {
            peripheral,
            host,
            reconciler,
            _cancel: cancel,
        }
    }

    fn no_throttle() -> ReconcilerConfig {
        ReconcilerConfig {
            command_throttle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn target_writes(peripheral: &FakePeripheral) -> Vec<(Vec<u8>, bool)> {
        peripheral
            .writes()
            .into_iter()
            .filter(|(uuid, _, _)| *uuid == protocol::MOTOR_TARGET)
            .map(|(_, data, ack)| (data, ack))
            .collect()
    }

    fn last_position_state(host: &RecordingHost) -> Option<PositionState> {
        host.last("Balcony", |value| match value {
            ExposedValue::PositionState(state) => Some(*state),
            _ => None,
        })
    }

    fn last_target(host: &RecordingHost) -> Option<u8> {
        host.last("Balcony", |value| match value {
            ExposedValue::TargetPosition(target) => Some(*target),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_commands_wait_for_first_position_read() {
        let h = harness(no_throttle());
        h.peripheral.set_fail_connect(true);
        h.reconciler.poll_once().await;

        let err = h.reconciler.set_target_position(0).await.unwrap_err();
        assert!(matches!(err, CommandError::NotReady(_)));
        assert!(target_writes(&h.peripheral).is_empty());
        assert!(!h.reconciler.shade_state().movement_in_flight);

        h.peripheral.set_fail_connect(false);
        h.reconciler.poll_once().await; // device 0 -> host 100
        h.reconciler.set_target_position(0).await.unwrap();
        assert_eq!(target_writes(&h.peripheral), vec![(vec![100], false)]);
    }

    #[tokio::test]
    async fn test_balcony_scenario() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.peripheral.set_value(protocol::MOTOR_TARGET, &[30]);

        h.reconciler.poll_once().await;
        let state = h.reconciler.shade_state();
        assert_eq!(state.current_position, 70);
        assert_eq!(state.target_position, 70);
        assert_eq!(
            h.host.last("Balcony", |v| match v {
                ExposedValue::CurrentPosition(p) => Some(*p),
                _ => None,
            }),
            Some(70)
        );

        h.reconciler.set_target_position(40).await.unwrap();
        let state = h.reconciler.shade_state();
        assert_eq!(state.target_position, 40);
        assert_eq!(state.position_state, PositionState::Decreasing);
        assert!(state.movement_in_flight);
        assert_eq!(last_position_state(&h.host), Some(PositionState::Decreasing));
        assert_eq!(target_writes(&h.peripheral), vec![(vec![60], false)]);
    }

    #[tokio::test]
    async fn test_battery_threshold() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::BATTERY_LEVEL, &[8]);
        h.reconciler.poll_once().await;
        assert!(h.reconciler.battery_state().low);
        assert_eq!(
            h.host.last("Balcony", |v| match v {
                ExposedValue::StatusLowBattery(low) => Some(*low),
                _ => None,
            }),
            Some(true)
        );

        h.peripheral.set_value(protocol::BATTERY_LEVEL, &[11]);
        h.reconciler.poll_once().await;
        assert_eq!(
            h.reconciler.battery_state(),
            BatteryState {
                level: 11,
                low: false
            }
        );
    }

    #[tokio::test]
    async fn test_information_published_once() {
        let h = harness(no_throttle());
        h.reconciler.poll_once().await;
        h.reconciler.poll_once().await;
        let published: Vec<_> = h
            .host
            .updates()
            .into_iter()
            .filter(|(_, v)| matches!(v, ExposedValue::Information(_)))
            .collect();
        assert_eq!(published.len(), 1);
        let ExposedValue::Information(info) = &published[0].1 else {
            unreachable!()
        };
        assert_eq!(info.manufacturer, "Fake Motors");
    }

    #[tokio::test]
    async fn test_debounce_while_in_flight() {
        let h = harness(no_throttle());
        h.reconciler.poll_once().await; // device 0 -> host 100

        h.reconciler.set_target_position(40).await.unwrap();
        h.reconciler.set_target_position(20).await.unwrap();

        assert_eq!(h.reconciler.shade_state().target_position, 40);
        assert_eq!(target_writes(&h.peripheral).len(), 1);
    }

    #[tokio::test]
    async fn test_same_position_is_noop() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.reconciler.poll_once().await;
        h.host.clear_updates();

        h.reconciler.set_target_position(70).await.unwrap();
        assert!(!h.reconciler.shade_state().movement_in_flight);
        assert!(h.host.updates().is_empty());
        assert!(target_writes(&h.peripheral).is_empty());
    }

    #[tokio::test]
    async fn test_no_write_when_device_already_targeting() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.peripheral.set_value(protocol::MOTOR_TARGET, &[60]);
        h.reconciler.poll_once().await;

        h.reconciler.set_target_position(40).await.unwrap();
        assert!(h.reconciler.shade_state().movement_in_flight);
        assert!(target_writes(&h.peripheral).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let h = harness(no_throttle());
        let err = h.reconciler.set_target_position(101).await.unwrap_err();
        assert!(matches!(err, CommandError::OutOfRange(101)));
        assert!(h.peripheral.writes().is_empty());
    }

    #[tokio::test]
    async fn test_completion_within_tolerance() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.reconciler.poll_once().await;
        h.reconciler.set_target_position(40).await.unwrap();

        // Host 43 is outside the band around 40.
        h.peripheral.set_value(protocol::MOTOR_STATE, &[57]);
        h.reconciler.poll_once().await;
        assert!(h.reconciler.shade_state().movement_in_flight);

        // Host 42 is inside.
        h.peripheral.set_value(protocol::MOTOR_STATE, &[58]);
        h.reconciler.poll_once().await;
        let state = h.reconciler.shade_state();
        assert_eq!(state.position_state, PositionState::Stopped);
        assert!(!state.movement_in_flight);
        assert_eq!(state.target_position, 40);
        assert_eq!(last_position_state(&h.host), Some(PositionState::Stopped));
    }

    #[tokio::test]
    async fn test_target_adopted_on_first_poll_only() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_TARGET, &[30]);
        h.reconciler.poll_once().await;
        assert_eq!(h.reconciler.shade_state().target_position, 70);

        h.peripheral.set_value(protocol::MOTOR_TARGET, &[90]);
        h.reconciler.poll_once().await;
        assert_eq!(h.reconciler.shade_state().target_position, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_throttle() {
        let h = harness(ReconcilerConfig {
            command_throttle: Duration::from_secs(1),
            ..Default::default()
        });
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.reconciler.poll_once().await;

        h.reconciler.set_target_position(40).await.unwrap();
        h.reconciler.stop().await.unwrap();

        // Within the throttle window: ignored.
        h.reconciler.set_target_position(20).await.unwrap();
        assert!(!h.reconciler.shade_state().movement_in_flight);

        tokio::time::advance(Duration::from_millis(1001)).await;
        h.reconciler.set_target_position(20).await.unwrap();
        assert!(h.reconciler.shade_state().movement_in_flight);
        assert_eq!(target_writes(&h.peripheral).len(), 2);
    }

    #[tokio::test]
    async fn test_stop_adopts_current_position() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.reconciler.poll_once().await;
        h.reconciler.set_target_position(40).await.unwrap();

        h.peripheral.set_value(protocol::MOTOR_STATE, &[45]);
        h.reconciler.stop().await.unwrap();

        let state = h.reconciler.shade_state();
        assert_eq!(state.current_position, 55);
        assert_eq!(state.target_position, 55);
        assert_eq!(state.position_state, PositionState::Stopped);
        assert!(!state.movement_in_flight);
        assert!(h
            .peripheral
            .writes()
            .contains(&(protocol::MOTOR_CONTROL, vec![protocol::STOP_COMMAND], false)));
    }

    #[tokio::test]
    async fn test_write_failure_restores_target() {
        let h = harness(no_throttle());
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.peripheral.set_value(protocol::MOTOR_TARGET, &[30]);
        h.reconciler.poll_once().await;
        h.peripheral.set_fail_writes(true);

        let err = h.reconciler.set_target_position(40).await.unwrap_err();
        assert!(matches!(err, CommandError::Device { .. }));
        let state = h.reconciler.shade_state();
        assert!(!state.movement_in_flight);
        assert_eq!(state.position_state, PositionState::Stopped);
        assert_eq!(state.target_position, 70);
        assert_eq!(last_target(&h.host), Some(70));

        h.reconciler.poll_once().await;
        h.reconciler.poll_once().await;
        assert_eq!(h.reconciler.shade_state().target_position, 70);
        assert_eq!(last_target(&h.host), Some(70));

        h.peripheral.set_fail_writes(false);
        h.reconciler.set_target_position(40).await.unwrap();
        assert_eq!(target_writes(&h.peripheral), vec![(vec![60], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_movement_is_abandoned() {
        let h = harness(ReconcilerConfig {
            command_throttle: Duration::ZERO,
            stall_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);
        h.reconciler.poll_once().await;
        h.reconciler.set_target_position(20).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        h.reconciler.poll_once().await;
        assert!(h.reconciler.shade_state().movement_in_flight);

        tokio::time::advance(Duration::from_secs(61)).await;
        h.reconciler.poll_once().await;
        let state = h.reconciler.shade_state();
        assert!(!state.movement_in_flight);
        assert_eq!(state.target_position, 70);
        assert_eq!(state.position_state, PositionState::Stopped);
    }

    #[tokio::test]
    async fn test_inconsistent_state_forced_on_second_poll() {
        let h = harness(no_throttle());
        h.reconciler.poll_once().await;
        h.reconciler.state().shade.movement_in_flight = true;

        h.reconciler.poll_once().await;
        assert!(h.reconciler.shade_state().movement_in_flight);

        h.reconciler.poll_once().await;
        assert!(!h.reconciler.shade_state().movement_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_connect_failures() {
        let h = harness(ReconcilerConfig {
            poll_interval: Duration::from_secs(10),
            ..Default::default()
        });
        h.peripheral.set_fail_connect(true);
        h.peripheral.set_value(protocol::MOTOR_STATE, &[30]);

        let cancel = CancellationToken::new();
        let task = h.reconciler.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(h.host.updates().is_empty());

        h.peripheral.set_fail_connect(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.reconciler.shade_state().current_position, 70);

        cancel.cancel();
        task.await.unwrap();
    }
}
