//! BLE Scanner Module
//!
//! Finds the configured shades among advertising peripherals. The motors do
//! not advertise a filterable service, so the scan is unfiltered and every
//! advertisement is matched against the configured addresses here.

use crate::domain::error::TransportError;
use crate::domain::models::{normalize_address, DeviceIdentity};
use crate::infrastructure::bluetooth::transport::{
    BleCentral, BlePeripheral, CentralEvent, RadioState,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every configured device was found and handed off.
    Complete,
    /// The scan was cancelled before all devices were found.
    Cancelled,
}

/// Scanner for configured shade motors
pub struct PeripheralScanner<C: BleCentral> {
    central: Arc<C>,
    devices: Vec<DeviceIdentity>,
    discovered: HashSet<String>,
    scanning: bool,
}

impl<C: BleCentral> PeripheralScanner<C> {
    /// Create a new scanner. Duplicate addresses in `devices` are dropped.
    pub fn new(central: Arc<C>, devices: Vec<DeviceIdentity>) -> Self {
        let mut unique: Vec<DeviceIdentity> = Vec::with_capacity(devices.len());
        for device in devices {
            if unique.contains(&device) {
                warn!(device = %device, "device configured twice, ignoring duplicate");
                continue;
            }
            unique.push(device);
        }

        Self {
            central,
            devices: unique,
            discovered: HashSet::new(),
            scanning: false,
        }
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Runs one scan session, calling `on_match` exactly once per configured
    /// device found. Returns when all are found or `cancel` fires.
    pub async fn run<F>(
        &mut self,
        cancel: &CancellationToken,
        mut on_match: F,
    ) -> Result<ScanOutcome, TransportError>
    where
        F: FnMut(DeviceIdentity, C::Peripheral),
    {
        self.discovered.clear();
        if self.devices.is_empty() {
            return Ok(ScanOutcome::Complete);
        }

        let mut events = self.central.events().await?;
        match self.central.radio_state().await? {
            RadioState::PoweredOn => self.resume().await,
            state => info!(?state, "waiting for Bluetooth radio to power on"),
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop().await;
                    return Ok(ScanOutcome::Cancelled);
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                self.stop().await;
                return Err(TransportError::new("BLE event stream closed"));
            };

            match event {
                CentralEvent::RadioStateChanged(RadioState::PoweredOn) => {
                    if !self.scanning {
                        self.resume().await;
                    }
                }
                CentralEvent::RadioStateChanged(state) => {
                    warn!(?state, "Bluetooth radio not powered on, scan suspended");
                    self.scanning = false;
                }
                CentralEvent::ScanStopped => {
                    if self.scanning {
                        warn!(
                            found = self.discovered.len(),
                            expected = self.devices.len(),
                            "scan stopped early, restarting"
                        );
                        self.scanning = false;
                        self.resume().await;
                    }
                }
                CentralEvent::Discovered(peripheral) => {
                    if self.on_discovered(peripheral, &mut on_match)
                        && self.discovered.len() == self.devices.len()
                    {
                        info!(count = self.devices.len(), "all configured shades found");
                        self.stop().await;
                        return Ok(ScanOutcome::Complete);
                    }
                }
            }
        }
    }

    /// Returns true when `peripheral` was a new configured device.
    fn on_discovered<F>(&mut self, peripheral: C::Peripheral, on_match: &mut F) -> bool
    where
        F: FnMut(DeviceIdentity, C::Peripheral),
    {
        let address = peripheral.address();
        let key = normalize_address(&address);
        if self.discovered.contains(&key) {
            trace!(%address, "already discovered");
            return false;
        }
        let Some(device) = self.devices.iter().find(|d| d.key() == key) else {
            trace!(%address, "ignoring unconfigured peripheral");
            return false;
        };

        info!(device = %device.name, %address, "found configured shade");
        self.discovered.insert(key);
        on_match(device.clone(), peripheral);
        true
    }

    /// Starts scanning. A failure leaves the scan suspended until the radio
    /// reports powered on again or the stack reports another stop.
    async fn resume(&mut self) {
        if let Err(e) = self.start().await {
            warn!(error = %e, "failed to start scan, waiting for the radio");
            self.scanning = false;
        }
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        info!(devices = self.devices.len(), "starting BLE scan");
        self.central.start_scan(&[]).await?;
        self.scanning = true;
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.scanning {
            return;
        }
        debug!("stopping BLE scan");
        if let Err(e) = self.central.stop_scan().await {
            warn!(error = %e, "failed to stop scan");
        }
        self.scanning = false;
    }
}
