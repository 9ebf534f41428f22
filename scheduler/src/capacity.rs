//! Capacity engine.
//!
//! Pure functions over an `Inventory` plus the live-graph `used` sum plus
//! any overlay delta, mirroring `market::pulse::*`'s modules:
//! no I/O, no async, given-inputs-produce-output. `effective_capacity`
//! truncates toward zero, matching `graph::model::Inventory`'s own
//! definition exactly (this module never recomputes that arithmetic
//! itself — it calls the canonical method so the two can never drift).

use graph::model::Inventory;

use crate::types::CapacitySnapshot;

/// Read-only view of a planning overlay's net effect on one inventory's
/// `used` sum. `request_overlay_none()` below is the live-only case; a
/// simulation session's delta log implements this by folding its
/// `SpeculativeDelta` log for the (provider, class) pair.
/// Threaded as a parameter rather than a second code path.
pub trait CapacityOverlay {
    /// Net change to `used` for this inventory introduced by the overlay.
    /// May be negative (a `move`/`deallocate` delta frees capacity).
    fn delta_used(&self, provider_id: common::EntityId, class: &graph::model::ResourceClass) -> i64;
}

/// No overlay: every delta is zero. Used for live (non-simulated) planning.
pub struct NoOverlay;

impl CapacityOverlay for NoOverlay {
    fn delta_used(&self, _provider_id: common::EntityId, _class: &graph::model::ResourceClass) -> i64 {
        0
    }
}

/// `(capacity, used, free)` for one inventory, with `used` already folded
/// against the overlay.
pub fn snapshot(inv: &Inventory, live_used: u64, overlay: &impl CapacityOverlay) -> CapacitySnapshot {
    let capacity = inv.effective_capacity();
    let delta = overlay.delta_used(inv.resource_provider_id, &inv.resource_class);
    let used = apply_delta(live_used, delta);
    let free = capacity.saturating_sub(used);
    CapacitySnapshot { capacity, used, free }
}

fn apply_delta(live_used: u64, delta: i64) -> u64 {
    if delta >= 0 {
        live_used.saturating_add(delta as u64)
    } else {
        live_used.saturating_sub(delta.unsigned_abs())
    }
}

/// Whether requesting `amount` against `inv` is feasible right now, per the
/// exact predicate:
/// `a ≥ min_unit ∧ a ≤ max_unit ∧ a mod step_size = 0 ∧ a ≤ free`.
pub fn is_feasible(inv: &Inventory, amount: u64, live_used: u64, overlay: &impl CapacityOverlay) -> bool {
    if amount < inv.min_unit || amount > inv.max_unit || amount % inv.step_size != 0 {
        return false;
    }
    let snap = snapshot(inv, live_used, overlay);
    amount <= snap.free
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EntityId;
    use graph::model::{ResourceClass, StandardResourceClass};

    fn inv(total: u64, reserved: u64, ratio: f64) -> Inventory {
        Inventory {
            resource_provider_id: EntityId::nil(),
            resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
            total,
            reserved,
            min_unit: 1,
            max_unit: total,
            step_size: 1,
            allocation_ratio: ratio,
        }
    }

    #[test]
    fn feasible_within_free_capacity() {
        let i = inv(8, 0, 1.0);
        assert!(is_feasible(&i, 4, 0, &NoOverlay));
        assert!(!is_feasible(&i, 9, 0, &NoOverlay));
    }

    #[test]
    fn step_size_violation_is_infeasible() {
        let mut i = inv(8, 0, 1.0);
        i.step_size = 2;
        assert!(!is_feasible(&i, 3, 0, &NoOverlay));
        assert!(is_feasible(&i, 4, 0, &NoOverlay));
    }

    struct FixedOverlay(i64);
    impl CapacityOverlay for FixedOverlay {
        fn delta_used(&self, _p: EntityId, _c: &ResourceClass) -> i64 {
            self.0
        }
    }

    #[test]
    fn negative_overlay_delta_frees_capacity() {
        let i = inv(8, 0, 1.0);
        // live used = 8 (full), but overlay records a move away freeing 4.
        assert!(!is_feasible(&i, 4, 8, &NoOverlay));
        assert!(is_feasible(&i, 4, 8, &FixedOverlay(-4)));
    }

    #[test]
    fn over_subscription_ratio_allows_more_than_total() {
        let i = inv(8, 0, 4.0);
        assert_eq!(i.effective_capacity(), 32);
        assert!(is_feasible(&i, 32, 0, &NoOverlay));
        assert!(!is_feasible(&i, 33, 0, &NoOverlay));
    }
}
