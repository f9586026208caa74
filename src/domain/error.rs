use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a BLE backend.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of a single device operation. Every variant is recoverable by
/// retrying the whole operation later.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("cannot connect to {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("unexpected GATT layout: {0}")]
    ProtocolMismatch(String),

    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
}

impl DeviceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no devices configured")]
    NoDevices,

    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A host command that could not be carried out.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("position {0} is out of range (0-100)")]
    OutOfRange(u8),

    #[error("position of {0} is not known yet")]
    NotReady(String),

    #[error("could not move {device}: {source}")]
    Device {
        device: String,
        #[source]
        source: DeviceError,
    },
}
