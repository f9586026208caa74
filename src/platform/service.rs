//! Shade Platform
//!
//! Coordinates discovery: validates the configured device list, reconciles it
//! against the host's accessory cache, scans, and gives every found shade its
//! own GATT session and reconciler.

use crate::domain::error::ConfigError;
use crate::domain::host::AccessoryHost;
use crate::domain::models::DeviceIdentity;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::GattSession;
use crate::infrastructure::bluetooth::scanner::{PeripheralScanner, ScanOutcome};
use crate::infrastructure::bluetooth::transport::BleCentral;
use crate::platform::reconciler::{ReconcilerConfig, ShadeReconciler};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main platform service owning every shade's session and reconciler
pub struct ShadePlatform<C: BleCentral> {
    central: Arc<C>,
    host: Arc<dyn AccessoryHost>,
    settings: Settings,
    cancel: CancellationToken,
    reconcilers: Vec<ShadeReconciler>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BleCentral> ShadePlatform<C> {
    pub fn new(central: Arc<C>, host: Arc<dyn AccessoryHost>, settings: Settings) -> Self {
        Self {
            central,
            host,
            settings,
            cancel: CancellationToken::new(),
            reconcilers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Token that stops discovery and every shade when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reconcilers(&self) -> &[ShadeReconciler] {
        &self.reconcilers
    }

    /// Runs discovery after the configured delay, then keeps the shades
    /// running until cancelled. Discovery failures are logged, never returned.
    pub async fn run(&mut self) {
        let delay = self.settings.discovery_delay();
        if !delay.is_zero() {
            info!(?delay, "delaying discovery");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match self.discover().await {
            Ok(ScanOutcome::Complete) => info!("discovery complete"),
            Ok(ScanOutcome::Cancelled) => info!("discovery cancelled"),
            Err(e) => match e.downcast_ref::<ConfigError>() {
                Some(config) => error!(error = %config, "configuration error, discovery halted"),
                None => error!("discovery failed: {e:#}"),
            },
        }

        self.cancel.cancelled().await;
        self.shutdown().await;
    }

    /// One discovery pass.
    pub async fn discover(&mut self) -> Result<ScanOutcome> {
        let configured = self.settings.devices.clone();
        let cached = self.host.cached_accessories();

        if configured.is_empty() {
            if !cached.is_empty() {
                warn!(
                    count = cached.len(),
                    "no devices configured, removing cached accessories"
                );
                self.host.unregister_accessories(&cached);
            }
            return Err(ConfigError::NoDevices.into());
        }

        let stale: Vec<DeviceIdentity> = cached
            .into_iter()
            .filter(|accessory| !configured.contains(accessory))
            .collect();
        if !stale.is_empty() {
            for accessory in &stale {
                info!(device = %accessory, "removing accessory no longer configured");
            }
            self.host.unregister_accessories(&stale);
        }

        let mut scanner = PeripheralScanner::new(self.central.clone(), configured);
        let scan_cancel = self.cancel.child_token();
        let outcome = scanner
            .run(&scan_cancel, |identity, peripheral| self.attach(identity, peripheral))
            .await
            .context("BLE scan failed")?;
        Ok(outcome)
    }

    fn attach(&mut self, identity: DeviceIdentity, peripheral: C::Peripheral) {
        match self.host.restore_cached_accessory(&identity) {
            Some(_) => info!(device = %identity, "restored cached accessory"),
            None => {
                info!(device = %identity, "registering new accessory");
                self.host.register_accessory(&identity);
            }
        }

        let shade_cancel = self.cancel.child_token();
        let (session, session_task) = GattSession::spawn(
            peripheral,
            self.settings.operation_timeout(),
            shade_cancel.clone(),
        );
        let reconciler = ShadeReconciler::new(
            identity.clone(),
            session,
            self.host.clone(),
            ReconcilerConfig::from(&self.settings),
        );
        self.host.bind_controller(&identity, reconciler.clone());
        self.tasks.push(reconciler.spawn(shade_cancel));
        self.tasks.push(session_task);
        self.reconcilers.push(reconciler);
    }

    /// Cancels everything and waits for the shade tasks to wind down.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "shade task ended abnormally");
            }
        }
        info!("platform stopped");
    }
}
