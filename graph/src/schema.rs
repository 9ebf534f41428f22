//! Schema invariants, enforced at write time rather than deferred to a
//! query-time validation pass. These are pure checks; the store adapter
//! calls them inside its write transactions before mutating any state.

use std::collections::{HashMap, HashSet};

use common::EntityId;

use crate::model::{Inventory, ResourceClass, ResourceProvider, StandardResourceClass, TraitRef};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaViolation {
    #[error("duplicate name '{0}'")]
    DuplicateName(String),
    #[error("duplicate uuid '{0}'")]
    DuplicateUuid(EntityId),
    #[error("parent_of would create a cycle at provider {0}")]
    ForestCycle(EntityId),
    #[error("provider {0} already has a parent")]
    AlreadyHasParent(EntityId),
    #[error("provider {0} cannot be deleted: it has children or active allocations")]
    ProviderInUse(EntityId),
    #[error("inventory already exists for provider {0} class {1:?}")]
    DuplicateInventory(EntityId, ResourceClass),
    #[error("cannot rename or delete standard resource class {0:?}")]
    StandardClassImmutable(StandardResourceClass),
    #[error("cannot rename or delete standard trait")]
    StandardTraitImmutable,
    #[error("custom name must match CUSTOM_[A-Z0-9_]+: {0}")]
    InvalidCustomName(String),
}

/// Checks that `candidate_parent` does not create a cycle and that `child`
/// does not already have a different parent recorded (a forest: at most one
/// parent, no cycles).
pub fn check_forest_insertion(
    providers: &HashMap<EntityId, ResourceProvider>,
    child: EntityId,
    candidate_parent: EntityId,
) -> Result<(), SchemaViolation> {
    if child == candidate_parent {
        return Err(SchemaViolation::ForestCycle(child));
    }

    // Walk up from candidate_parent; if we reach `child`, inserting the
    // edge would close a cycle.
    let mut cursor = Some(candidate_parent);
    let mut steps = 0usize;
    while let Some(id) = cursor {
        if id == child {
            return Err(SchemaViolation::ForestCycle(child));
        }
        cursor = providers.get(&id).and_then(|p| p.parent_id);
        steps += 1;
        if steps > providers.len() + 1 {
            // Defensive: existing state already has a cycle, which should
            // be unreachable if this function gates every insertion.
            return Err(SchemaViolation::ForestCycle(child));
        }
    }

    Ok(())
}

pub fn check_unique_name(
    existing_names: &HashSet<String>,
    name: &str,
) -> Result<(), SchemaViolation> {
    if existing_names.contains(name) {
        Err(SchemaViolation::DuplicateName(name.to_string()))
    } else {
        Ok(())
    }
}

pub fn check_unique_uuid(
    existing_ids: &HashSet<EntityId>,
    id: EntityId,
) -> Result<(), SchemaViolation> {
    if existing_ids.contains(&id) {
        Err(SchemaViolation::DuplicateUuid(id))
    } else {
        Ok(())
    }
}

/// At most one Inventory per (RP, class).
pub fn check_unique_inventory(
    inventories: &HashMap<(EntityId, ResourceClass), Inventory>,
    provider_id: EntityId,
    class: &ResourceClass,
) -> Result<(), SchemaViolation> {
    if inventories.contains_key(&(provider_id, class.clone())) {
        Err(SchemaViolation::DuplicateInventory(provider_id, class.clone()))
    } else {
        Ok(())
    }
}

pub fn check_class_not_standard(class: &ResourceClass) -> Result<(), SchemaViolation> {
    match class {
        ResourceClass::Standard(s) => Err(SchemaViolation::StandardClassImmutable(*s)),
        ResourceClass::Custom(_) => Ok(()),
    }
}

pub fn check_trait_not_standard(t: &TraitRef) -> Result<(), SchemaViolation> {
    match t {
        TraitRef::Standard(_) => Err(SchemaViolation::StandardTraitImmutable),
        TraitRef::Custom(_) => Ok(()),
    }
}

pub fn check_provider_deletable(
    providers: &HashMap<EntityId, ResourceProvider>,
    has_allocations: bool,
    provider_id: EntityId,
) -> Result<(), SchemaViolation> {
    let has_children = providers.values().any(|p| p.parent_id == Some(provider_id));
    if has_children || has_allocations {
        Err(SchemaViolation::ProviderInUse(provider_id))
    } else {
        Ok(())
    }
}
