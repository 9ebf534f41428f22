//! `CapacityOverlay` implementation over one session's pending delta log.
//!
//! Lets capacity reads route through a session's deltas instead of live
//! state alone, the single code path spec.md §4.6 calls for: the same
//! `scheduler::capacity::is_feasible` that plans against live state plans
//! against a simulation by swapping in this overlay. `AllocationRequest`'s
//! `overlay_session_id` names the session the caller resolved; the caller
//! wraps the snapshot in a `SessionOverlay` and threads it into
//! `scheduler::candidates::plan` as the `CapacityOverlay` parameter.

use common::EntityId;
use graph::model::ResourceClass;
use scheduler::capacity::CapacityOverlay;

use crate::model::{DeltaKind, SimulationSession};

pub struct SessionOverlay<'s> {
    session: &'s SimulationSession,
}

impl<'s> SessionOverlay<'s> {
    pub fn new(session: &'s SimulationSession) -> Self {
        Self { session }
    }
}

impl CapacityOverlay for SessionOverlay<'_> {
    fn delta_used(&self, provider_id: EntityId, class: &ResourceClass) -> i64 {
        net_delta(self.session.deltas.iter(), provider_id, class)
    }
}

/// Net change to `used` on `(provider_id, class)` folded across `deltas`, in
/// sequence order (order does not matter for the net sum, only for replay).
pub(crate) fn net_delta<'d>(
    deltas: impl Iterator<Item = &'d crate::model::SpeculativeDelta>,
    provider_id: EntityId,
    class: &ResourceClass,
) -> i64 {
    let mut delta = 0i64;
    for d in deltas {
        match &d.kind {
            DeltaKind::Allocate { provider, resources } if *provider == provider_id => {
                delta += amount_for(resources, class) as i64;
            }
            DeltaKind::Deallocate { provider, resources } if *provider == provider_id => {
                delta -= amount_for(resources, class) as i64;
            }
            DeltaKind::Move { from_provider, to_provider, resources } => {
                if *from_provider == provider_id {
                    delta -= amount_for(resources, class) as i64;
                }
                if *to_provider == provider_id {
                    delta += amount_for(resources, class) as i64;
                }
            }
            _ => {}
        }
    }
    delta
}

/// Net change to a single consumer's `used` on `(provider_id, class)`,
/// folded across only the deltas belonging to that consumer — used to
/// validate a `deallocate`/`move` against what the consumer actually holds
/// in the overlay rather than the provider-wide aggregate.
pub(crate) fn consumer_net_delta(
    session: &SimulationSession,
    consumer_id: EntityId,
    provider_id: EntityId,
    class: &ResourceClass,
) -> i64 {
    net_delta(session.deltas.iter().filter(|d| d.consumer_id == consumer_id), provider_id, class)
}

pub(crate) fn amount_for(resources: &[(ResourceClass, u64)], class: &ResourceClass) -> u64 {
    resources.iter().find(|(c, _)| c == class).map(|(_, amt)| *amt).unwrap_or(0)
}
