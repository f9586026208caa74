//! Console accessory host
//!
//! A minimal [`AccessoryHost`] for running the bridge from a terminal: the
//! accessory cache is a JSON file, exposed values go to the log and commands
//! are read line by line from stdin.

use crate::domain::host::AccessoryHost;
use crate::domain::models::{DeviceIdentity, ExposedValue};
use crate::platform::reconciler::ShadeReconciler;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CACHE_FILE_NAME: &str = "accessories.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Set { name: String, position: u8 },
    Stop { name: String },
    Status,
}

/// Parses `set <name> <0-100>`, `stop <name>` or `status`. Names may contain
/// spaces.
pub fn parse_command(line: &str) -> Result<ConsoleCommand> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match verb.to_lowercase().as_str() {
        "set" => {
            let Some((name, position)) = rest.rsplit_once(char::is_whitespace) else {
                bail!("usage: set <name> <0-100>");
            };
            let position: u8 = position
                .parse()
                .with_context(|| format!("invalid position '{position}'"))?;
            if position > 100 {
                bail!("position {position} is out of range (0-100)");
            }
            Ok(ConsoleCommand::Set {
                name: name.trim().to_string(),
                position,
            })
        }
        "stop" if !rest.is_empty() => Ok(ConsoleCommand::Stop {
            name: rest.to_string(),
        }),
        "stop" => bail!("usage: stop <name>"),
        "status" => Ok(ConsoleCommand::Status),
        "" => bail!("empty command"),
        other => bail!("unknown command '{other}' (expected set, stop or status)"),
    }
}

pub struct ConsoleHost {
    cache_path: PathBuf,
    accessories: Mutex<Vec<DeviceIdentity>>,
    controllers: Mutex<HashMap<String, ShadeReconciler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConsoleHost {
    /// Loads the accessory cache from `cache_path`; a missing file is an empty cache.
    pub fn load(cache_path: impl Into<PathBuf>) -> Result<Self> {
        let cache_path = cache_path.into();
        let accessories = if cache_path.exists() {
            let content = std::fs::read_to_string(&cache_path)
                .with_context(|| format!("failed to read {}", cache_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid accessory cache {}", cache_path.display()))?
        } else {
            Vec::new()
        };

        Ok(Self {
            cache_path,
            accessories: Mutex::new(accessories),
            controllers: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn persist(&self, accessories: &[DeviceIdentity]) {
        let result = serde_json::to_string_pretty(accessories)
            .context("failed to serialize accessory cache")
            .and_then(|json| {
                if let Some(parent) = self.cache_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.cache_path, json)?;
                Ok(())
            });
        if let Err(e) = result {
            error!(path = %self.cache_path.display(), "failed to save accessory cache: {e:#}");
        }
    }

    fn controller(&self, name: &str) -> Result<ShadeReconciler> {
        lock(&self.controllers)
            .get(&name.to_lowercase())
            .cloned()
            .with_context(|| format!("no shade named '{name}'"))
    }

    /// Runs one command and returns the text to show the user.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<String> {
        match command {
            ConsoleCommand::Set { name, position } => {
                self.controller(&name)?.set_target_position(position).await?;
                Ok(format!("{name}: moving to {position}"))
            }
            ConsoleCommand::Stop { name } => {
                self.controller(&name)?.stop().await?;
                Ok(format!("{name}: stopped"))
            }
            ConsoleCommand::Status => Ok(self.status()),
        }
    }

    fn status(&self) -> String {
        let controllers = lock(&self.controllers);
        if controllers.is_empty() {
            return "no shades connected yet".to_string();
        }
        let mut lines: Vec<String> = controllers
            .values()
            .map(|controller| {
                let shade = controller.shade_state();
                let battery = controller.battery_state();
                format!(
                    "{}: position {} target {} {:?}, battery {}%{}",
                    controller.identity().name,
                    shade.current_position,
                    shade.target_position,
                    shade.position_state,
                    battery.level,
                    if battery.low { " (low)" } else { "" },
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }

    /// Reads commands from stdin until EOF or `cancel` fires.
    pub async fn run_stdin(&self, cancel: CancellationToken) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("stdin closed, console commands disabled");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => match self.execute(command).await {
                    Ok(reply) => println!("{reply}"),
                    Err(e) => println!("error: {e:#}"),
                },
                Err(e) => println!("error: {e:#}"),
            }
        }
    }
}

impl AccessoryHost for ConsoleHost {
    fn cached_accessories(&self) -> Vec<DeviceIdentity> {
        lock(&self.accessories).clone()
    }

    fn restore_cached_accessory(&self, identity: &DeviceIdentity) -> Option<DeviceIdentity> {
        lock(&self.accessories)
            .iter()
            .find(|cached| *cached == identity)
            .cloned()
    }

    fn register_accessory(&self, identity: &DeviceIdentity) {
        let snapshot = {
            let mut accessories = lock(&self.accessories);
            if accessories.contains(identity) {
                return;
            }
            accessories.push(identity.clone());
            accessories.clone()
        };
        info!(device = %identity, "accessory registered");
        self.persist(&snapshot);
    }

    fn unregister_accessories(&self, identities: &[DeviceIdentity]) {
        let snapshot = {
            let mut accessories = lock(&self.accessories);
            accessories.retain(|accessory| !identities.contains(accessory));
            accessories.clone()
        };
        {
            let mut controllers = lock(&self.controllers);
            controllers.retain(|_, controller| !identities.contains(controller.identity()));
        }
        for identity in identities {
            info!(device = %identity, "accessory unregistered");
        }
        self.persist(&snapshot);
    }

    fn update_value(&self, identity: &DeviceIdentity, value: ExposedValue) {
        match &value {
            ExposedValue::Information(information) => info!(
                device = %identity.name,
                manufacturer = %information.manufacturer,
                serial = %information.serial_number,
                firmware = %information.firmware_revision,
                "device information"
            ),
            value => debug!(device = %identity.name, ?value, "value updated"),
        }
    }

    fn bind_controller(&self, identity: &DeviceIdentity, controller: ShadeReconciler) {
        lock(&self.controllers).insert(identity.name.to_lowercase(), controller);
    }
}
