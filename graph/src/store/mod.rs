pub mod memory;

pub use memory::{GraphState, GraphWriter, MemoryGraphStore};

use common::EntityId;

use crate::model::{ResourceClass, ResourceProvider};

/// Tree distance + lexicographic-uuid tie-break, so two schedulers
/// presented with identical inputs produce identical candidate lists.
/// Implemented once here so every caller (constraints, weigher,
/// candidates) orders roots identically instead of re-deriving the rule.
pub fn tie_break_key(distance: usize, provider_id: EntityId) -> (usize, EntityId) {
    (distance, provider_id)
}

/// Walk from `start` to the forest root, returning the chain in
/// root-to-start order (root first).
pub fn ancestor_chain(
    providers: &std::collections::HashMap<EntityId, ResourceProvider>,
    start: EntityId,
) -> Vec<EntityId> {
    let mut chain = Vec::new();
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        chain.push(id);
        cursor = providers.get(&id).and_then(|p| p.parent_id);
    }
    chain.reverse();
    chain
}

pub fn distance_from_root(
    providers: &std::collections::HashMap<EntityId, ResourceProvider>,
    provider_id: EntityId,
) -> usize {
    ancestor_chain(providers, provider_id).len().saturating_sub(1)
}

pub fn class_name(class: &ResourceClass) -> String {
    match class {
        ResourceClass::Standard(s) => format!("{s:?}"),
        ResourceClass::Custom(name) => name.clone(),
    }
}
