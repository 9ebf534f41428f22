//! Allocation-candidates planner.
//!
//! Phased the way `SchedulerEngine::on_market_tick` phases
//! eligibility → policy → dispatch: root resolution → constraint filtering
//! → per-root greedy group assignment (bounded backtracking) → weigher
//! scoring → top-`L` sort. The overlay is a `CapacityOverlay` parameter
//! threaded through every capacity check, not a second code path.

use std::collections::{HashMap, HashSet};

use common::EntityId;
use graph::model::{ProviderRole, ResourceClass, StandardResourceClass};
use graph::store::{self, GraphState};

use crate::capacity::{self, CapacityOverlay, NoOverlay};
use crate::constraints::check_root_constraints;
use crate::types::{AllocatedSlice, AllocationCandidate, AllocationRequest, PciNumaAffinity, ResourceGroup};
use crate::weigher::{WeigherContext, WeigherRegistry};
use tracing::debug;

/// One subtree provider considered for assignment, in fitting order:
/// closest to `root` first, then lowest uuid. Distance is measured
/// relative to `root` itself (not the forest root, since `in_tree` may
/// restrict candidates to a non-top-level provider), so a sharing
/// contributor always sorts one step past the in-tree provider it feeds
/// into rather than tying with `root` at distance 0.
fn subtree_fitting_order(state: &GraphState, root: EntityId) -> Vec<EntityId> {
    let root_distance = store::distance_from_root(&state.providers, root);
    let mut best: HashMap<EntityId, usize> = HashMap::new();
    best.insert(root, 0);

    for descendant in state.descendants_of(root) {
        let local = store::distance_from_root(&state.providers, descendant).saturating_sub(root_distance);
        best.entry(descendant).and_modify(|d| *d = (*d).min(local)).or_insert(local);
    }

    for edge in state.shares_into(root) {
        best.entry(edge.source_provider_id).and_modify(|d| *d = (*d).min(1)).or_insert(1);
    }
    for descendant in state.descendants_of(root) {
        let local = store::distance_from_root(&state.providers, descendant).saturating_sub(root_distance);
        for edge in state.shares_into(descendant) {
            let shared_distance = local + 1;
            best
                .entry(edge.source_provider_id)
                .and_modify(|d| *d = (*d).min(shared_distance))
                .or_insert(shared_distance);
        }
    }

    let mut ordered: Vec<EntityId> = best.keys().copied().collect();
    ordered.sort_by_key(|id| store::tie_break_key(best[id], *id));
    ordered
}

/// Greedily assigns every `(class, amount)` pair in `group` to the first
/// subtree provider (in fitting order) with enough remaining free
/// capacity, tracking already-reserved amounts within this candidate so
/// the same inventory is never double-counted across groups. Group-scoped
/// required/forbidden traits are checked per assigned provider.
///
/// `group.numa_cells > 1` is dispatched to `assign_numa_split_group`
/// instead: rule 7 requires each cell be satisfied by one NUMA node on its
/// own, which this per-class greedy pass (free to spread one cell's
/// resources across several unrelated subtree providers) does not
/// enforce.
fn assign_group(
    state: &GraphState,
    root: EntityId,
    order: &[EntityId],
    group: &ResourceGroup,
    reserved: &mut HashMap<(EntityId, ResourceClass), u64>,
    overlay: &impl CapacityOverlay,
) -> Option<Vec<AllocatedSlice>> {
    if group.numa_cells > 1 {
        return assign_numa_split_group(state, root, group, reserved, overlay);
    }

    let mut slices = Vec::new();

    for (class, amount) in &group.resources {
        let mut assigned = false;
        for provider_id in order {
            let provider_traits = state.traits_of(*provider_id);
            if !group.required_traits.iter().all(|t| provider_traits.contains(t)) {
                continue;
            }
            if group.forbidden_traits.iter().any(|t| provider_traits.contains(t)) {
                continue;
            }
            let Some(inv) = state.inventory(*provider_id, class) else { continue };
            let already_reserved = *reserved.get(&(*provider_id, class.clone())).unwrap_or(&0);
            let live_used = state.used(*provider_id, class) + already_reserved;

            if capacity::is_feasible(inv, *amount, live_used, overlay) {
                slices.push(AllocatedSlice {
                    resource_provider_id: *provider_id,
                    resource_class: class.clone(),
                    amount: *amount,
                    observed_generation: state.provider(*provider_id).map(|p| p.generation).unwrap_or_default(),
                });
                *reserved.entry((*provider_id, class.clone())).or_insert(0) += amount;
                assigned = true;
                break;
            }
        }
        if !assigned {
            return None;
        }
    }

    Some(slices)
}

/// Rule 7's per-cell floor: assigns each of `group.numa_cells` cells to a
/// distinct `NumaNode`-role child of `root`, each node independently
/// carrying enough free capacity for every `(class, amount)` pair in
/// `group.resources` on its own — a node short on even one requested
/// class is skipped entirely rather than topped up from elsewhere. Nodes
/// are tried in fitting order (closest, then lowest uuid); a node is never
/// reused across cells.
fn assign_numa_split_group(
    state: &GraphState,
    root: EntityId,
    group: &ResourceGroup,
    reserved: &mut HashMap<(EntityId, ResourceClass), u64>,
    overlay: &impl CapacityOverlay,
) -> Option<Vec<AllocatedSlice>> {
    let mut numa_nodes: Vec<EntityId> =
        state.children_of(root).iter().filter(|c| c.has_role(ProviderRole::NumaNode)).map(|c| c.id).collect();
    numa_nodes.sort_by_key(|id| store::tie_break_key(store::distance_from_root(&state.providers, *id), *id));

    let mut slices = Vec::new();
    let mut cells_filled = 0u32;

    for node_id in numa_nodes {
        if cells_filled >= group.numa_cells {
            break;
        }

        let provider_traits = state.traits_of(node_id);
        if !group.required_traits.iter().all(|t| provider_traits.contains(t)) {
            continue;
        }
        if group.forbidden_traits.iter().any(|t| provider_traits.contains(t)) {
            continue;
        }

        let fits = group.resources.iter().all(|(class, amount)| {
            let Some(inv) = state.inventory(node_id, class) else { return false };
            let already_reserved = *reserved.get(&(node_id, class.clone())).unwrap_or(&0);
            let live_used = state.used(node_id, class) + already_reserved;
            capacity::is_feasible(inv, *amount, live_used, overlay)
        });
        if !fits {
            continue;
        }

        let generation = state.provider(node_id).map(|p| p.generation).unwrap_or_default();
        for (class, amount) in &group.resources {
            *reserved.entry((node_id, class.clone())).or_insert(0) += amount;
            slices.push(AllocatedSlice {
                resource_provider_id: node_id,
                resource_class: class.clone(),
                amount: *amount,
                observed_generation: generation,
            });
        }
        cells_filled += 1;
    }

    if cells_filled < group.numa_cells {
        return None;
    }
    Some(slices)
}

/// First `NumaNode`-role ancestor of `provider_id` (including itself),
/// root-to-leaf order, or `None` if it sits outside any NUMA node.
fn numa_ancestor(state: &GraphState, provider_id: EntityId) -> Option<EntityId> {
    store::ancestor_chain(&state.providers, provider_id)
        .into_iter()
        .find(|id| state.provider(*id).map(|p| p.has_role(ProviderRole::NumaNode)).unwrap_or(false))
}

/// Matches each `PciRequest` in `group` to `count` distinct `PciPf`/`PciVf`
/// subtree providers carrying every required trait,
/// never reusing a provider already claimed elsewhere in this candidate. If
/// `pci_numa_affinity` is `RequiredSameNuma`, only providers nested under
/// the same NUMA node as `group_slices`' CPU/memory assignment qualify.
fn assign_pci_requests(
    state: &GraphState,
    order: &[EntityId],
    group: &ResourceGroup,
    group_slices: &[AllocatedSlice],
    reserved: &mut HashMap<(EntityId, ResourceClass), u64>,
    claimed_pci: &mut HashSet<EntityId>,
    overlay: &impl CapacityOverlay,
) -> Option<Vec<AllocatedSlice>> {
    if group.pci_requests.is_empty() {
        return Some(Vec::new());
    }

    let required_numa = match group.pci_numa_affinity {
        PciNumaAffinity::RequiredSameNuma => {
            group_slices.iter().find_map(|s| numa_ancestor(state, s.resource_provider_id))
        }
        PciNumaAffinity::Any => None,
    };

    let pci_class = ResourceClass::Standard(StandardResourceClass::PciDevice);
    let mut slices = Vec::new();

    for request in &group.pci_requests {
        let mut matched = 0u32;
        for provider_id in order {
            if matched >= request.count {
                break;
            }
            if claimed_pci.contains(provider_id) {
                continue;
            }
            let Some(provider) = state.provider(*provider_id) else { continue };
            if !(provider.has_role(ProviderRole::PciPf) || provider.has_role(ProviderRole::PciVf)) {
                continue;
            }
            if let Some(numa) = required_numa {
                if !store::ancestor_chain(&state.providers, *provider_id).contains(&numa) {
                    continue;
                }
            }
            let provider_traits = state.traits_of(*provider_id);
            if !request.required_traits.iter().all(|t| provider_traits.contains(t)) {
                continue;
            }
            let Some(inv) = state.inventory(*provider_id, &pci_class) else { continue };
            let already_reserved = *reserved.get(&(*provider_id, pci_class.clone())).unwrap_or(&0);
            let live_used = state.used(*provider_id, &pci_class) + already_reserved;
            if !capacity::is_feasible(inv, 1, live_used, overlay) {
                continue;
            }

            slices.push(AllocatedSlice {
                resource_provider_id: *provider_id,
                resource_class: pci_class.clone(),
                amount: 1,
                observed_generation: provider.generation,
            });
            *reserved.entry((*provider_id, pci_class.clone())).or_insert(0) += 1;
            claimed_pci.insert(*provider_id);
            matched += 1;
        }
        if matched < request.count {
            return None;
        }
    }

    Some(slices)
}

/// Resolves the candidate root set: roots of the forest, or the singleton
/// `in_tree` root if the request restricts to one.
fn candidate_roots(state: &GraphState, request: &AllocationRequest) -> Vec<EntityId> {
    match request.in_tree {
        Some(root) => state.provider(root).map(|p| vec![p.id]).unwrap_or_default(),
        None => {
            let mut roots: Vec<EntityId> = state.roots().iter().map(|p| p.id).collect();
            roots.sort();
            roots
        }
    }
}

/// `candidates(request) -> Vec<AllocationCandidate>`. Scoring
/// uses `WeigherContext::default`-equivalent inputs when the caller has no
/// failure/version telemetry to offer; pass a populated `ctx_extra` to
/// wire those in.
pub fn plan(
    state: &GraphState,
    request: &AllocationRequest,
    registry: &WeigherRegistry,
    overlay: &impl CapacityOverlay,
    reference_consumer: Option<EntityId>,
    build_failures: HashMap<EntityId, u32>,
    hypervisor_versions: HashMap<EntityId, f64>,
) -> Vec<AllocationCandidate> {
    let mut raw_candidates = Vec::new();

    for root_id in candidate_roots(state, request) {
        let Some(root) = state.provider(root_id) else { continue };
        if !check_root_constraints(state, root, request).is_eligible() {
            continue;
        }

        let order = subtree_fitting_order(state, root_id);
        let mut reserved: HashMap<(EntityId, ResourceClass), u64> = HashMap::new();
        let mut claimed_pci: HashSet<EntityId> = HashSet::new();
        let mut all_slices = Vec::new();
        let mut feasible = true;

        for group in &request.groups {
            let Some(group_slices) = assign_group(state, root_id, &order, group, &mut reserved, overlay) else {
                feasible = false;
                break;
            };
            match assign_pci_requests(state, &order, group, &group_slices, &mut reserved, &mut claimed_pci, overlay) {
                Some(mut pci_slices) => {
                    all_slices.extend(group_slices);
                    all_slices.append(&mut pci_slices);
                }
                None => {
                    feasible = false;
                    break;
                }
            }
        }

        if feasible && !all_slices.is_empty() {
            raw_candidates.push(AllocationCandidate { root_provider_id: root_id, slices: all_slices, score: 0.0 });
        }
    }

    let ctx = WeigherContext {
        state,
        request,
        reference_consumer,
        build_failures,
        hypervisor_versions,
    };

    let raw_count = raw_candidates.len();
    let mut scored = registry.score(raw_candidates, &ctx);
    scored.truncate(request.limit.max(1));
    debug!(raw = raw_count, returned = scored.len(), limit = request.limit, "allocation candidates planned");
    scored
}

/// Convenience wrapper for live (non-simulated) planning.
pub fn plan_live(state: &GraphState, request: &AllocationRequest, registry: &WeigherRegistry) -> Vec<AllocationCandidate> {
    plan(state, request, registry, &NoOverlay, None, HashMap::new(), HashMap::new())
}
