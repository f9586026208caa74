//! The narrow slice of the accessory host the core talks to.

use crate::domain::models::{DeviceIdentity, ExposedValue};
use crate::platform::reconciler::ShadeReconciler;

/// Accessory registry, value sink and command binding in one place.
///
/// Implementations must be cheap and non-blocking: they are called from the
/// poll loops.
pub trait AccessoryHost: Send + Sync {
    /// Accessories the host restored from its own cache at startup.
    fn cached_accessories(&self) -> Vec<DeviceIdentity>;

    /// Returns the cached accessory for `identity`, if the host has one.
    fn restore_cached_accessory(&self, identity: &DeviceIdentity) -> Option<DeviceIdentity>;

    fn register_accessory(&self, identity: &DeviceIdentity);

    fn unregister_accessories(&self, identities: &[DeviceIdentity]);

    fn update_value(&self, identity: &DeviceIdentity, value: ExposedValue);

    /// Hands the host the entry point for user-issued commands.
    fn bind_controller(&self, identity: &DeviceIdentity, controller: ShadeReconciler);
}
