//! Bluetooth Module
//!
//! BLE access to the shade motors.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────┐        ┌─────────────────────────────┐
//!  │ PeripheralScanner│        │ GattSession (one per shade) │
//!  │ - advertisement  │ ─────▶ │ - connect / discover once   │
//!  │   matching       │ hand-  │ - timeout-bounded I/O       │
//!  └────────┬─────────┘  off   └──────────────┬──────────────┘
//!           │                                 │
//!           ▼                                 ▼
//!  ┌──────────────────────────────────────────────────────────┐
//!  │      transport: BleCentral / BlePeripheral traits        │
//!  │      winrt (Windows)  ·  btleplug_backend (feature)      │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and byte encodings
//! - [`transport`] - the capability set a BLE stack must provide
//! - [`scanner`] - discovery of configured shades
//! - [`connection`] - per-shade GATT session actor

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
#[cfg(windows)]
pub mod winrt;

pub use connection::{GattSession, SessionHandle};
pub use scanner::{PeripheralScanner, ScanOutcome};
