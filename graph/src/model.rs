//! The resource/consumer graph's entity types.
//!
//! Every first-class attribute gets its own typed field here; a single
//! `Properties` bag is reserved for opaque vendor extensions, not used for
//! anything this module already models.

use std::collections::{HashMap, HashSet};

use common::{EntityId, Generation};
use serde::{Deserialize, Serialize};

/// Opaque vendor-extension property bag. Never used for fields this crate
/// already models explicitly.
pub type Properties = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------
// Resource classes & traits
// ---------------------------------------------------------------------

/// Frozen standard resource class identifiers. New standard classes are
/// added by a release of the `standard_traits_source` list, never by this
/// crate's callers: standard classes are immutable once defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardResourceClass {
    Vcpu,
    MemoryMb,
    DiskGb,
    PciDevice,
    SriovNetVf,
    NumaSocket,
    Vgpu,
    IpV4Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Standard(StandardResourceClass),
    Custom(String),
}

impl ResourceClass {
    /// Builds a custom resource class, validating the name matches
    /// `CUSTOM_[A-Z0-9_]+`.
    pub fn custom(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if is_valid_custom_name(&name) {
            Ok(ResourceClass::Custom(name))
        } else {
            Err(format!("invalid custom resource class name: {name}"))
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, ResourceClass::Standard(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardTrait {
    HwCpuX86Avx2,
    ComputeStatusDisabled,
    HwCpuX86Avx512f,
    StorageDiskSsd,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraitRef {
    Standard(StandardTrait),
    Custom(String),
}

impl TraitRef {
    pub fn custom(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if is_valid_custom_name(&name) {
            Ok(TraitRef::Custom(name))
        } else {
            Err(format!("invalid custom trait name: {name}"))
        }
    }
}

fn is_valid_custom_name(name: &str) -> bool {
    name.starts_with("CUSTOM_")
        && name[7..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && name.len() > 7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitConstraintKind {
    Required,
    Forbidden,
    Preferred,
    Avoided,
}

/// A `requires_trait` edge from a flavor/request group to a trait, carrying
/// the constraint kind and a weight used only by the soft kinds.
#[derive(Debug, Clone)]
pub struct TraitRequirement {
    pub trait_ref: TraitRef,
    pub kind: TraitConstraintKind,
    pub weight: f64,
}

// ---------------------------------------------------------------------
// Resource providers & inventories
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderRole {
    ComputeHost,
    NumaNode,
    PciPf,
    PciVf,
    PhysicalGpu,
    VgpuType,
}

#[derive(Debug, Clone)]
pub struct ResourceProvider {
    pub id: EntityId,
    pub name: String,
    pub generation: Generation,
    pub parent_id: Option<EntityId>,
    pub disabled: bool,
    pub roles: HashSet<ProviderRole>,
}

impl ResourceProvider {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn has_role(&self, role: ProviderRole) -> bool {
        self.roles.contains(&role)
    }
}

/// A single (RP, ResourceClass) capacity record.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub resource_provider_id: EntityId,
    pub resource_class: ResourceClass,
    pub total: u64,
    pub reserved: u64,
    pub min_unit: u64,
    pub max_unit: u64,
    pub step_size: u64,
    pub allocation_ratio: f64,
}

impl Inventory {
    /// `⌊(total − reserved) × allocation_ratio⌋`, truncated toward zero.
    /// `allocation_ratio` applies to `(total - reserved)`, not to `total`
    /// alone.
    pub fn effective_capacity(&self) -> u64 {
        let headroom = self.total.saturating_sub(self.reserved) as f64;
        (headroom * self.allocation_ratio) as u64
    }
}

// ---------------------------------------------------------------------
// Consumers & allocations
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: EntityId,
    pub generation: Generation,
    pub project_id: EntityId,
    pub user_id: EntityId,
    pub consumer_type: String,
}

/// A `consumes` edge: Consumer → Inventory, carrying the `used` amount.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub consumer_id: EntityId,
    pub resource_provider_id: EntityId,
    pub resource_class: ResourceClass,
    pub used: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

// ---------------------------------------------------------------------
// Aggregates, flavors, server groups, sharing
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub id: EntityId,
    pub properties: Properties,
    /// At most one AZ projected per aggregate.
    pub availability_zone: Option<String>,
    pub tenant_allowed: Option<HashSet<EntityId>>,
    pub image_allowed: Option<HashSet<EntityId>>,
}

#[derive(Debug, Clone)]
pub struct Flavor {
    pub id: EntityId,
    pub name: String,
    pub resources: Vec<(ResourceClass, u64)>,
    pub required_traits: Vec<TraitRequirement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerGroupPolicy {
    Affinity,
    AntiAffinity,
    SoftAffinity,
    SoftAntiAffinity,
}

#[derive(Debug, Clone)]
pub struct ServerGroup {
    pub id: EntityId,
    pub policy: ServerGroupPolicy,
    pub max_server_per_host: Option<u32>,
    pub members: Vec<EntityId>,
}

/// `SharesResources` edge: source RP contributes `classes` to `target`,
/// cross-tree.
#[derive(Debug, Clone)]
pub struct SharesResources {
    pub source_provider_id: EntityId,
    pub target_provider_id: EntityId,
    pub classes: HashSet<ResourceClass>,
}
