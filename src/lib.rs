//! Bridges BLE window-shade motors to a home-automation accessory host.
//!
//! - [`domain`] - identities, shade state, position arithmetic, settings and errors
//! - [`infrastructure`] - BLE transport, GATT sessions, scanning and logging
//! - [`platform`] - discovery orchestration and per-shade reconciliation
//! - [`presentation`] - the console host used by the `shade-bridge` binary

pub mod domain;
pub mod infrastructure;
pub mod platform;
pub mod presentation;

#[cfg(test)]
pub(crate) mod test_utils;
