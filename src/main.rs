//! shade-bridge - drives BLE window shades from the terminal
//!
//! This is the binary entry point. All logic lives in the library.

use anyhow::{Context, Result};
use clap::Parser;
use shade_bridge::domain::settings::{Settings, SettingsService};
use shade_bridge::infrastructure::bluetooth::transport::BleCentral;
use shade_bridge::infrastructure::logging;
use shade_bridge::platform::ShadePlatform;
use shade_bridge::presentation::console::{ConsoleHost, CACHE_FILE_NAME};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// shade-bridge - BLE window shade controller
#[derive(Parser, Debug)]
#[command(name = "shade-bridge", version)]
#[command(
    about = "Keeps BLE window shades in sync and accepts move commands on stdin",
    long_about = None
)]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `shade_bridge=trace` (overrides the settings file)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(run(args));
    // A pending stdin read would otherwise keep the runtime alive.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args) -> Result<()> {
    let settings = SettingsService::load(args.config).context("failed to load settings")?;
    let config_dir = settings.config_dir();
    let _logging = logging::init_logger(
        &settings.get().log_settings,
        args.log_level.as_deref(),
        &config_dir,
    )?;
    info!(
        path = %settings.path().display(),
        devices = settings.get().devices.len(),
        "starting shade-bridge"
    );

    let host = Arc::new(ConsoleHost::load(config_dir.join(CACHE_FILE_NAME))?);

    start(host, settings.get().clone()).await
}

#[cfg(windows)]
async fn start(host: Arc<ConsoleHost>, settings: Settings) -> Result<()> {
    use shade_bridge::infrastructure::bluetooth::winrt::WinRtCentral;
    let central = WinRtCentral::new()
        .await
        .context("failed to open the Windows Bluetooth stack")?;
    run_with(Arc::new(central), host, settings).await
}

#[cfg(all(not(windows), feature = "btleplug"))]
async fn start(host: Arc<ConsoleHost>, settings: Settings) -> Result<()> {
    use shade_bridge::infrastructure::bluetooth::btleplug_backend::BtleplugCentral;
    let central = BtleplugCentral::new()
        .await
        .context("failed to open the Bluetooth adapter")?;
    run_with(Arc::new(central), host, settings).await
}

#[cfg(all(not(windows), not(feature = "btleplug")))]
async fn start(_host: Arc<ConsoleHost>, _settings: Settings) -> Result<()> {
    anyhow::bail!("no BLE backend on this platform; rebuild with `--features btleplug`")
}

#[cfg_attr(all(not(windows), not(feature = "btleplug")), allow(dead_code))]
async fn run_with<C: BleCentral>(
    central: Arc<C>,
    host: Arc<ConsoleHost>,
    settings: Settings,
) -> Result<()> {
    let mut platform = ShadePlatform::new(central, host.clone(), settings);
    let cancel = platform.cancellation_token();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        on_signal.cancel();
    });

    let console = tokio::spawn({
        let host = host.clone();
        let cancel = cancel.clone();
        async move { host.run_stdin(cancel).await }
    });

    platform.run().await;
    console.await.context("console task panicked")?;
    Ok(())
}
