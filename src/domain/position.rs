//! Position arithmetic shared by the reconciler and its command path.
//!
//! The motor firmware counts 0 = open .. 100 = closed; the host counts the
//! other way round. Everything here is pure so it can be checked exhaustively.

use crate::domain::models::PositionState;

pub const MAX_POSITION: u8 = 100;

/// Default tolerance band around a target, absorbing mechanical overshoot.
pub const DEFAULT_TOLERANCE: u8 = 2;

pub const LOW_BATTERY_THRESHOLD: u8 = 10;

/// Converts between device and host convention. Out-of-range input saturates.
pub fn invert(position: u8) -> u8 {
    MAX_POSITION - position.min(MAX_POSITION)
}

/// True when `current` lies in `[target - tolerance, target + tolerance]`,
/// clamped to the valid position range.
pub fn done_moving(current: u8, target: u8, tolerance: u8) -> bool {
    let low = target.saturating_sub(tolerance);
    let high = target.saturating_add(tolerance).min(MAX_POSITION);
    (low..=high).contains(&current)
}

/// Direction the shade travels to reach `target` from `current` (host convention).
pub fn direction(current: u8, target: u8) -> PositionState {
    if target > current {
        PositionState::Increasing
    } else {
        PositionState::Decreasing
    }
}
