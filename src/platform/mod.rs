//! Shade orchestration on top of the BLE layer.

pub mod reconciler;
pub mod service;

pub use reconciler::{ReconcilerConfig, ShadeReconciler};
pub use service::ShadePlatform;
