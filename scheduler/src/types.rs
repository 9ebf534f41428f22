//! Request/response types shared across the capacity, constraint, weigher,
//! and candidates modules.

use std::collections::HashSet;

use common::{EntityId, Generation};
use graph::model::{ResourceClass, ServerGroupPolicy, TraitRequirement};

/// One PCI device request within a group: `count` distinct PCI-role
/// providers (PF or VF), each carrying every trait in `required_traits`.
#[derive(Debug, Clone)]
pub struct PciRequest {
    pub count: u32,
    pub required_traits: HashSet<graph::model::TraitRef>,
}

/// Whether matched PCI providers must nest under the same NUMA node as the
/// group's CPU/memory allocation (PCI-NUMA affinity mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciNumaAffinity {
    Any,
    RequiredSameNuma,
}

/// One resource group within an allocation request: the default (unsuffixed)
/// group plus any number of suffixed groups (e.g. for multi-NUMA requests).
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    /// Empty string for the default/unsuffixed group.
    pub suffix: String,
    pub resources: Vec<(ResourceClass, u64)>,
    pub required_traits: HashSet<graph::model::TraitRef>,
    pub forbidden_traits: HashSet<graph::model::TraitRef>,
    pub member_of: Vec<HashSet<EntityId>>,
    /// Number of NUMA cells this group must be split across, each cell
    /// independently satisfying `resources`. `1` means
    /// no NUMA splitting is required.
    pub numa_cells: u32,
    pub pci_requests: Vec<PciRequest>,
    pub pci_numa_affinity: PciNumaAffinity,
}

impl ResourceGroup {
    pub fn default_group(resources: Vec<(ResourceClass, u64)>) -> Self {
        Self {
            suffix: String::new(),
            resources,
            required_traits: HashSet::new(),
            forbidden_traits: HashSet::new(),
            member_of: Vec::new(),
            numa_cells: 1,
            pci_requests: Vec::new(),
            pci_numa_affinity: PciNumaAffinity::Any,
        }
    }
}

/// Affinity hint toward an existing server group.
#[derive(Debug, Clone)]
pub struct ServerGroupHint {
    pub group_id: EntityId,
    pub policy: ServerGroupPolicy,
    pub max_server_per_host: Option<u32>,
}

/// Everything `candidates()` needs.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub groups: Vec<ResourceGroup>,
    pub preferred_traits: Vec<TraitRequirement>,
    pub avoided_traits: Vec<TraitRequirement>,
    pub in_tree: Option<EntityId>,
    pub project_id: EntityId,
    pub image_id: Option<EntityId>,
    pub availability_zone: Option<String>,
    pub server_group: Option<ServerGroupHint>,
    pub limit: usize,
    /// When set, capacity reads add this session's delta log to
    /// `current_used` instead of reading only live state.
    pub overlay_session_id: Option<EntityId>,
}

/// One (provider, class) slice of a successful candidate allocation.
#[derive(Debug, Clone)]
pub struct AllocatedSlice {
    pub resource_provider_id: EntityId,
    pub resource_class: ResourceClass,
    pub amount: u64,
    pub observed_generation: Generation,
}

/// A tentative assignment of a resource request to concrete (RP, inventory,
/// amount) triples.
#[derive(Debug, Clone)]
pub struct AllocationCandidate {
    pub root_provider_id: EntityId,
    pub slices: Vec<AllocatedSlice>,
    pub score: f64,
}

/// Per-inventory capacity engine output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacitySnapshot {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
}
