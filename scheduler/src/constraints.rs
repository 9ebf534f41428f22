//! Constraint engine.
//!
//! One pure, single-purpose `check_*` function per hard constraint,
//! mirroring `scheduler::eligibility`'s `check_session_eligibility` shape:
//! given state and a candidate root, return a reason enum rather than a
//! bool, so the caller can log *why* a root was excluded. Any failure
//! excludes the candidate; soft variants (server-group soft affinity,
//! trait preference/avoidance) are scored, never filtered, and live in
//! `weigher.rs` instead.

use std::collections::HashSet;

use common::EntityId;
use graph::model::{ProviderRole, ResourceProvider, ServerGroupPolicy, TraitRef};
use graph::store::GraphState;

use crate::types::{AllocationRequest, ServerGroupHint};

/// Reason a candidate root was excluded, or `Eligible`. Named after the
/// concrete rule so a caller can report precisely which
/// constraint failed without inspecting a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolation {
    Eligible,
    ProviderDisabled,
    ComputeStatusDisabled,
    MissingRequiredTrait,
    HasForbiddenTrait,
    AggregateMembershipMismatch,
    TenantNotAllowed,
    ImageNotAllowed,
    AvailabilityZoneMismatch,
    AffinityViolation,
    AntiAffinityViolation,
    NumaSplitInfeasible,
    PciFittingInfeasible,
}

impl ConstraintViolation {
    pub fn is_eligible(&self) -> bool {
        matches!(self, ConstraintViolation::Eligible)
    }
}

/// Rule 1: root not disabled, no required `compute_status_disabled` trait.
pub fn check_provider_eligibility(provider: &ResourceProvider) -> ConstraintViolation {
    if provider.disabled {
        return ConstraintViolation::ProviderDisabled;
    }
    ConstraintViolation::Eligible
}

pub fn check_compute_status_disabled(traits: &HashSet<TraitRef>) -> ConstraintViolation {
    if traits.contains(&TraitRef::Standard(graph::model::StandardTrait::ComputeStatusDisabled)) {
        return ConstraintViolation::ComputeStatusDisabled;
    }
    ConstraintViolation::Eligible
}

/// Rule 2: every required trait on the root (or group-scoped subtree,
/// left to the candidates planner to check per-provider for group scope).
pub fn check_required_traits(present: &HashSet<TraitRef>, required: &HashSet<TraitRef>) -> ConstraintViolation {
    if required.iter().all(|t| present.contains(t)) {
        ConstraintViolation::Eligible
    } else {
        ConstraintViolation::MissingRequiredTrait
    }
}

/// Rule 3: none of the forbidden traits present at the relevant scope.
pub fn check_forbidden_traits(present: &HashSet<TraitRef>, forbidden: &HashSet<TraitRef>) -> ConstraintViolation {
    if forbidden.iter().any(|t| present.contains(t)) {
        ConstraintViolation::HasForbiddenTrait
    } else {
        ConstraintViolation::Eligible
    }
}

/// Rule 4: aggregate membership (OR across the requested set), plus tenant
/// and image isolation on any aggregate the root belongs to that restricts
/// them.
pub fn check_aggregate_membership(
    state: &GraphState,
    provider_id: EntityId,
    member_of: &[HashSet<EntityId>],
    project_id: EntityId,
    image_id: Option<EntityId>,
) -> ConstraintViolation {
    let root_aggregates = state.aggregates_of(provider_id);

    for required_set in member_of {
        if required_set.intersection(&root_aggregates).next().is_none() {
            return ConstraintViolation::AggregateMembershipMismatch;
        }
    }

    for agg_id in &root_aggregates {
        if let Some(agg) = state.aggregate(*agg_id) {
            if let Some(allowed) = &agg.tenant_allowed {
                if !allowed.contains(&project_id) {
                    return ConstraintViolation::TenantNotAllowed;
                }
            }
            if let (Some(allowed), Some(image)) = (&agg.image_allowed, image_id) {
                if !allowed.contains(&image) {
                    return ConstraintViolation::ImageNotAllowed;
                }
            }
        }
    }

    ConstraintViolation::Eligible
}

/// Rule 5: if an AZ is requested, the root must belong to an aggregate
/// that projects that AZ.
pub fn check_availability_zone(
    state: &GraphState,
    provider_id: EntityId,
    requested_az: Option<&str>,
) -> ConstraintViolation {
    let Some(requested) = requested_az else {
        return ConstraintViolation::Eligible;
    };
    let belongs = state
        .aggregates_of(provider_id)
        .iter()
        .filter_map(|id| state.aggregate(*id))
        .any(|agg| agg.availability_zone.as_deref() == Some(requested));

    if belongs {
        ConstraintViolation::Eligible
    } else {
        ConstraintViolation::AvailabilityZoneMismatch
    }
}

/// Rule 6 (hard variants only — soft variants score in `weigher.rs`).
pub fn check_server_group_policy(
    state: &GraphState,
    candidate_root: EntityId,
    hint: &ServerGroupHint,
) -> ConstraintViolation {
    let Some(group) = state.server_group(hint.group_id) else {
        return ConstraintViolation::Eligible;
    };

    let placed_hosts: HashSet<EntityId> = group
        .members
        .iter()
        .flat_map(|consumer_id| state.allocations_of_consumer(*consumer_id))
        .map(|a| a.resource_provider_id)
        .collect();

    match hint.policy {
        ServerGroupPolicy::Affinity => {
            if placed_hosts.is_empty() || placed_hosts.contains(&candidate_root) {
                ConstraintViolation::Eligible
            } else {
                ConstraintViolation::AffinityViolation
            }
        }
        ServerGroupPolicy::AntiAffinity => {
            let occupants_on_root = group
                .members
                .iter()
                .flat_map(|c| state.allocations_of_consumer(*c))
                .filter(|a| a.resource_provider_id == candidate_root)
                .count() as u32;
            let limit = hint.max_server_per_host.unwrap_or(0);
            if occupants_on_root < limit.max(1) && limit > 0 {
                ConstraintViolation::Eligible
            } else if limit == 0 && occupants_on_root == 0 {
                ConstraintViolation::Eligible
            } else {
                ConstraintViolation::AntiAffinityViolation
            }
        }
        ServerGroupPolicy::SoftAffinity | ServerGroupPolicy::SoftAntiAffinity => ConstraintViolation::Eligible,
    }
}

/// Rule 7: NUMA split feasibility, structural precondition only (the root
/// must expose at least `numa_cells` `NumaNode`-role children). The actual
/// per-cell capacity floor — each chosen node independently satisfying
/// `group.resources` — is enforced in
/// `candidates::assign_numa_split_group`, which has the overlay and
/// per-candidate reservation tracking in scope; a root passing this check
/// can still fail there if its NUMA children don't individually have
/// enough free capacity.
pub fn check_numa_topology(state: &GraphState, root: EntityId, numa_cells: u32) -> ConstraintViolation {
    if numa_cells <= 1 {
        return ConstraintViolation::Eligible;
    }
    let numa_children = state
        .children_of(root)
        .iter()
        .filter(|c| c.has_role(ProviderRole::NumaNode))
        .count() as u32;
    if numa_children >= numa_cells {
        ConstraintViolation::Eligible
    } else {
        ConstraintViolation::NumaSplitInfeasible
    }
}

/// Rule 8: PCI fitting, structural precondition only. The root (including
/// shared-in subtrees) must expose at least as many `PciPf`/`PciVf`-role
/// descendants as the group requests in total; trait matching and the
/// PCI-NUMA affinity check happen per-candidate in `candidates.rs`, which
/// has the concrete subtree assignment in scope.
pub fn check_pci_topology(state: &GraphState, root: EntityId, requested_count: u32) -> ConstraintViolation {
    if requested_count == 0 {
        return ConstraintViolation::Eligible;
    }
    let available = state
        .descendants_of(root)
        .into_iter()
        .filter(|id| {
            state
                .provider(*id)
                .map(|p| p.has_role(ProviderRole::PciPf) || p.has_role(ProviderRole::PciVf))
                .unwrap_or(false)
        })
        .count() as u32;
    if available >= requested_count {
        ConstraintViolation::Eligible
    } else {
        ConstraintViolation::PciFittingInfeasible
    }
}

/// Evaluate every root-granularity hard constraint for one candidate root.
/// Group-scoped trait checks and the per-group coverage/partition rule
/// (rule 9) are evaluated during group assignment in `candidates.rs`,
/// since they require the subtree walk, not just the root.
pub fn check_root_constraints(
    state: &GraphState,
    root: &ResourceProvider,
    request: &AllocationRequest,
) -> ConstraintViolation {
    let v = check_provider_eligibility(root);
    if !v.is_eligible() {
        return v;
    }

    let root_traits = state.traits_of(root.id);
    let v = check_compute_status_disabled(&root_traits);
    if !v.is_eligible() {
        return v;
    }

    if let Some(group) = request.groups.first() {
        let v = check_required_traits(&root_traits, &group.required_traits);
        if !v.is_eligible() {
            return v;
        }
        let v = check_forbidden_traits(&root_traits, &group.forbidden_traits);
        if !v.is_eligible() {
            return v;
        }
        let v = check_aggregate_membership(
            state,
            root.id,
            &group.member_of,
            request.project_id,
            request.image_id,
        );
        if !v.is_eligible() {
            return v;
        }
        let v = check_numa_topology(state, root.id, group.numa_cells);
        if !v.is_eligible() {
            return v;
        }
        let pci_count: u32 = group.pci_requests.iter().map(|r| r.count).sum();
        let v = check_pci_topology(state, root.id, pci_count);
        if !v.is_eligible() {
            return v;
        }
    }

    let v = check_availability_zone(state, root.id, request.availability_zone.as_deref());
    if !v.is_eligible() {
        return v;
    }

    if let Some(hint) = &request.server_group {
        let v = check_server_group_policy(state, root.id, hint);
        if !v.is_eligible() {
            return v;
        }
    }

    ConstraintViolation::Eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Generation;

    fn provider(disabled: bool) -> ResourceProvider {
        ResourceProvider {
            id: EntityId::new_v4(),
            name: "p".into(),
            generation: Generation::INITIAL,
            parent_id: None,
            disabled,
            roles: HashSet::new(),
        }
    }

    #[test]
    fn disabled_provider_is_excluded() {
        let p = provider(true);
        assert_eq!(check_provider_eligibility(&p), ConstraintViolation::ProviderDisabled);
    }

    #[test]
    fn required_trait_present_passes() {
        let mut present = HashSet::new();
        present.insert(TraitRef::Standard(graph::model::StandardTrait::HwCpuX86Avx2));
        let mut required = HashSet::new();
        required.insert(TraitRef::Standard(graph::model::StandardTrait::HwCpuX86Avx2));
        assert!(check_required_traits(&present, &required).is_eligible());
    }

    #[test]
    fn missing_required_trait_fails() {
        let present = HashSet::new();
        let mut required = HashSet::new();
        required.insert(TraitRef::Standard(graph::model::StandardTrait::HwCpuX86Avx2));
        assert_eq!(
            check_required_traits(&present, &required),
            ConstraintViolation::MissingRequiredTrait
        );
    }

    #[test]
    fn forbidden_trait_present_fails() {
        let mut present = HashSet::new();
        present.insert(TraitRef::Standard(graph::model::StandardTrait::ComputeStatusDisabled));
        let mut forbidden = HashSet::new();
        forbidden.insert(TraitRef::Standard(graph::model::StandardTrait::ComputeStatusDisabled));
        assert_eq!(
            check_forbidden_traits(&present, &forbidden),
            ConstraintViolation::HasForbiddenTrait
        );
    }

    #[test]
    fn numa_split_requires_enough_children() {
        let state = GraphState::default();
        let root = EntityId::new_v4();
        assert_eq!(
            check_numa_topology(&state, root, 2),
            ConstraintViolation::NumaSplitInfeasible
        );
        assert!(check_numa_topology(&state, root, 1).is_eligible());
    }

    #[test]
    fn pci_topology_requires_enough_pci_role_descendants() {
        let mut state = GraphState::default();
        let root_provider = provider(false);
        let root = root_provider.id;
        state.providers.insert(root, root_provider);

        assert_eq!(check_pci_topology(&state, root, 1), ConstraintViolation::PciFittingInfeasible);

        let mut pf = provider(false);
        pf.parent_id = Some(root);
        pf.roles.insert(graph::model::ProviderRole::PciPf);
        let pf_id = pf.id;
        state.providers.insert(pf_id, pf);

        assert!(check_pci_topology(&state, root, 1).is_eligible());
        assert_eq!(check_pci_topology(&state, root, 2), ConstraintViolation::PciFittingInfeasible);
    }
}
