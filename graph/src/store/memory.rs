//! In-memory, whole-store-mutex-serialized `GraphStore` adapter.
//!
//! Guarantees that transactions are serializable per session and that
//! concurrent sessions only ever see committed writes, the way
//! `MarketManager`/`SessionManager` guard their shared maps with
//! `Arc<Mutex<HashMap<..>>>`: a single async mutex around the whole graph,
//! held for the duration of one transaction. `run_transaction` clones the
//! pre-transaction state, runs the closure against a live `GraphWriter`, and
//! restores the clone on any `Err` — giving a "no partial writes" rollback
//! guarantee without a WAL.

use std::collections::{HashMap, HashSet};

use common::{EntityId, Generation, Result, TachyonError};
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{
    Aggregate, Allocation, Consumer, Flavor, Inventory, ResourceClass, ResourceProvider,
    ServerGroup, SharesResources, TraitRef,
};
use crate::schema;

/// All graph state. `Clone` backs the rollback-by-snapshot transaction
/// model below.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub providers: HashMap<EntityId, ResourceProvider>,
    pub provider_names: HashSet<String>,
    pub inventories: HashMap<(EntityId, ResourceClass), Inventory>,
    pub provider_traits: HashMap<EntityId, HashSet<TraitRef>>,
    pub consumers: HashMap<EntityId, Consumer>,
    pub allocations: HashMap<(EntityId, EntityId, ResourceClass), Allocation>,
    pub aggregates: HashMap<EntityId, Aggregate>,
    pub aggregate_members: HashMap<EntityId, HashSet<EntityId>>, // aggregate -> provider ids
    pub provider_aggregates: HashMap<EntityId, HashSet<EntityId>>, // provider -> aggregate ids
    pub flavors: HashMap<EntityId, Flavor>,
    pub server_groups: HashMap<EntityId, ServerGroup>,
    pub shares: Vec<SharesResources>,
    pub global_generation: Generation,
}

impl GraphState {
    // -------------------- reads --------------------

    pub fn provider(&self, id: EntityId) -> Option<&ResourceProvider> {
        self.providers.get(&id)
    }

    pub fn roots(&self) -> Vec<&ResourceProvider> {
        self.providers.values().filter(|p| p.is_root()).collect()
    }

    pub fn children_of(&self, id: EntityId) -> Vec<&ResourceProvider> {
        self.providers.values().filter(|p| p.parent_id == Some(id)).collect()
    }

    /// All descendants (not including `id` itself), unordered.
    pub fn descendants_of(&self, id: EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(cur) = frontier.pop() {
            for child in self.children_of(cur) {
                out.push(child.id);
                frontier.push(child.id);
            }
        }
        out
    }

    pub fn inventories_of(&self, provider_id: EntityId) -> Vec<&Inventory> {
        self.inventories.values().filter(|i| i.resource_provider_id == provider_id).collect()
    }

    pub fn inventory(&self, provider_id: EntityId, class: &ResourceClass) -> Option<&Inventory> {
        self.inventories.get(&(provider_id, class.clone()))
    }

    pub fn traits_of(&self, provider_id: EntityId) -> HashSet<TraitRef> {
        self.provider_traits.get(&provider_id).cloned().unwrap_or_default()
    }

    pub fn aggregates_of(&self, provider_id: EntityId) -> HashSet<EntityId> {
        self.provider_aggregates.get(&provider_id).cloned().unwrap_or_default()
    }

    pub fn aggregate(&self, id: EntityId) -> Option<&Aggregate> {
        self.aggregates.get(&id)
    }

    /// Sharing edges whose *target* is `provider_id` — i.e. sharing
    /// providers contributing resources into this provider's subtree
    /// (providers with their own roots, contributing into another
    /// subtree).
    pub fn shares_into(&self, provider_id: EntityId) -> Vec<&SharesResources> {
        self.shares.iter().filter(|s| s.target_provider_id == provider_id).collect()
    }

    /// Sum of `used` across all `consumes` edges into one inventory.
    pub fn used(&self, provider_id: EntityId, class: &ResourceClass) -> u64 {
        self.allocations
            .values()
            .filter(|a| a.resource_provider_id == provider_id && &a.resource_class == class)
            .map(|a| a.used)
            .sum()
    }

    pub fn allocations_of_consumer(&self, consumer_id: EntityId) -> Vec<&Allocation> {
        self.allocations.values().filter(|a| a.consumer_id == consumer_id).collect()
    }

    pub fn consumer(&self, id: EntityId) -> Option<&Consumer> {
        self.consumers.get(&id)
    }

    pub fn server_group(&self, id: EntityId) -> Option<&ServerGroup> {
        self.server_groups.get(&id)
    }

    pub fn flavor(&self, id: EntityId) -> Option<&Flavor> {
        self.flavors.get(&id)
    }
}

/// A live handle into locked graph state, used inside one
/// `run_transaction` closure. Every method either fully applies or, on
/// `Err`, leaves the eventual rollback to the caller (the closure should
/// return `Err` as soon as an invariant check fails; `run_transaction`
/// restores the pre-transaction snapshot).
pub struct GraphWriter<'a> {
    pub state: &'a mut GraphState,
}

impl<'a> GraphWriter<'a> {
    pub fn read(&self) -> &GraphState {
        self.state
    }

    fn bump_global(&mut self) {
        self.state.global_generation = self.state.global_generation.bumped();
    }

    pub fn create_provider(
        &mut self,
        id: EntityId,
        name: String,
        parent_id: Option<EntityId>,
        roles: HashSet<crate::model::ProviderRole>,
    ) -> Result<()> {
        let ids: HashSet<EntityId> = self.state.providers.keys().copied().collect();
        schema::check_unique_uuid(&ids, id).map_err(schema_err)?;
        schema::check_unique_name(&self.state.provider_names, &name).map_err(schema_err)?;
        if let Some(parent) = parent_id {
            if !self.state.providers.contains_key(&parent) {
                return Err(TachyonError::not_found("ResourceProvider", parent.to_string()));
            }
            schema::check_forest_insertion(&self.state.providers, id, parent).map_err(schema_err)?;
        }

        self.state.provider_names.insert(name.clone());
        self.state.providers.insert(
            id,
            ResourceProvider {
                id,
                name,
                generation: Generation::INITIAL,
                parent_id,
                disabled: false,
                roles,
            },
        );
        self.bump_global();
        Ok(())
    }

    pub fn set_disabled(&mut self, provider_id: EntityId, disabled: bool) -> Result<()> {
        let p = self
            .state
            .providers
            .get_mut(&provider_id)
            .ok_or_else(|| TachyonError::not_found("ResourceProvider", provider_id.to_string()))?;
        p.disabled = disabled;
        p.generation = p.generation.bumped();
        self.bump_global();
        Ok(())
    }

    pub fn delete_provider(&mut self, provider_id: EntityId) -> Result<()> {
        let has_allocations = self
            .state
            .allocations
            .values()
            .any(|a| a.resource_provider_id == provider_id);
        schema::check_provider_deletable(&self.state.providers, has_allocations, provider_id)
            .map_err(schema_err)?;

        if let Some(p) = self.state.providers.remove(&provider_id) {
            self.state.provider_names.remove(&p.name);
        }
        self.state.inventories.retain(|(rp, _), _| *rp != provider_id);
        self.bump_global();
        Ok(())
    }

    pub fn set_inventory(&mut self, inv: Inventory) -> Result<()> {
        if !self.state.providers.contains_key(&inv.resource_provider_id) {
            return Err(TachyonError::not_found(
                "ResourceProvider",
                inv.resource_provider_id.to_string(),
            ));
        }
        let key = (inv.resource_provider_id, inv.resource_class.clone());
        let is_new = !self.state.inventories.contains_key(&key);
        if is_new {
            schema::check_unique_inventory(
                &self.state.inventories,
                inv.resource_provider_id,
                &inv.resource_class,
            )
            .map_err(schema_err)?;
        }
        let provider_id = inv.resource_provider_id;
        self.state.inventories.insert(key, inv);

        let p = self.state.providers.get_mut(&provider_id).expect("checked above");
        p.generation = p.generation.bumped();
        self.bump_global();
        Ok(())
    }

    pub fn attach_trait(&mut self, provider_id: EntityId, t: TraitRef) -> Result<()> {
        if !self.state.providers.contains_key(&provider_id) {
            return Err(TachyonError::not_found("ResourceProvider", provider_id.to_string()));
        }
        self.state.provider_traits.entry(provider_id).or_default().insert(t);
        let p = self.state.providers.get_mut(&provider_id).expect("checked above");
        p.generation = p.generation.bumped();
        self.bump_global();
        Ok(())
    }

    pub fn detach_trait(&mut self, provider_id: EntityId, t: &TraitRef) -> Result<()> {
        schema::check_trait_not_standard(t).map_err(schema_err)?;
        if let Some(set) = self.state.provider_traits.get_mut(&provider_id) {
            set.remove(t);
        }
        if let Some(p) = self.state.providers.get_mut(&provider_id) {
            p.generation = p.generation.bumped();
        }
        self.bump_global();
        Ok(())
    }

    pub fn upsert_aggregate(&mut self, agg: Aggregate) -> Result<()> {
        self.state.aggregates.insert(agg.id, agg);
        self.bump_global();
        Ok(())
    }

    pub fn join_aggregate(&mut self, provider_id: EntityId, aggregate_id: EntityId) -> Result<()> {
        if !self.state.providers.contains_key(&provider_id) {
            return Err(TachyonError::not_found("ResourceProvider", provider_id.to_string()));
        }
        if !self.state.aggregates.contains_key(&aggregate_id) {
            return Err(TachyonError::not_found("Aggregate", aggregate_id.to_string()));
        }
        self.state.aggregate_members.entry(aggregate_id).or_default().insert(provider_id);
        self.state.provider_aggregates.entry(provider_id).or_default().insert(aggregate_id);
        if let Some(p) = self.state.providers.get_mut(&provider_id) {
            p.generation = p.generation.bumped();
        }
        self.bump_global();
        Ok(())
    }

    pub fn upsert_consumer(&mut self, consumer: Consumer) -> Result<()> {
        self.state.consumers.insert(consumer.id, consumer);
        Ok(())
    }

    /// Create a `consumes` edge, enforcing the per-edge invariant that:
    /// `min_unit ≤ used ≤ max_unit`, `used mod step_size = 0`, and that the
    /// inventory's effective capacity is not exceeded.
    pub fn record_allocation(&mut self, alloc: Allocation) -> Result<()> {
        let inv = self
            .state
            .inventory(alloc.resource_provider_id, &alloc.resource_class)
            .ok_or_else(|| {
                TachyonError::not_found("Inventory", alloc.resource_provider_id.to_string())
            })?
            .clone();

        if alloc.used < inv.min_unit
            || alloc.used > inv.max_unit
            || alloc.used % inv.step_size != 0
        {
            return Err(TachyonError::bad_request(format!(
                "allocation amount {} violates unit constraints for inventory {:?}",
                alloc.used, alloc.resource_class
            )));
        }

        let current_used = self.state.used(alloc.resource_provider_id, &alloc.resource_class);
        if current_used + alloc.used > inv.effective_capacity() {
            return Err(TachyonError::out_of_capacity(format!(
                "provider {} class {:?}: {} + {} > {}",
                alloc.resource_provider_id,
                alloc.resource_class,
                current_used,
                alloc.used,
                inv.effective_capacity()
            )));
        }

        let consumer_id = alloc.consumer_id;
        let key = (consumer_id, alloc.resource_provider_id, alloc.resource_class.clone());
        self.state.allocations.insert(key, alloc.clone());

        if let Some(p) = self.state.providers.get_mut(&alloc.resource_provider_id) {
            p.generation = p.generation.bumped();
        }
        if let Some(c) = self.state.consumers.get_mut(&consumer_id) {
            c.generation = c.generation.bumped();
        }
        self.bump_global();
        Ok(())
    }

    pub fn remove_allocation(
        &mut self,
        consumer_id: EntityId,
        provider_id: EntityId,
        class: &ResourceClass,
    ) -> Result<()> {
        self.state.allocations.remove(&(consumer_id, provider_id, class.clone()));
        if let Some(p) = self.state.providers.get_mut(&provider_id) {
            p.generation = p.generation.bumped();
        }
        if let Some(c) = self.state.consumers.get_mut(&consumer_id) {
            c.generation = c.generation.bumped();
        }
        self.bump_global();

        // Consumers with zero outgoing `consumes` edges are
        // garbage-collectable.
        if self.state.allocations_of_consumer(consumer_id).is_empty() {
            self.state.consumers.remove(&consumer_id);
        }
        Ok(())
    }

    /// Replace every allocation a consumer holds with a new set, as a
    /// single atomic step: if replacing prior allocations, remove them
    /// first, then create the new consumes edges.
    pub fn replace_allocations(
        &mut self,
        consumer_id: EntityId,
        new_allocations: Vec<Allocation>,
    ) -> Result<()> {
        let existing: Vec<(EntityId, EntityId, ResourceClass)> = self
            .state
            .allocations_of_consumer(consumer_id)
            .into_iter()
            .map(|a| (a.consumer_id, a.resource_provider_id, a.resource_class.clone()))
            .collect();
        for key in existing {
            self.state.allocations.remove(&key);
        }

        for alloc in new_allocations {
            self.record_allocation(alloc)?;
        }
        Ok(())
    }

    pub fn create_flavor(&mut self, flavor: Flavor) -> Result<()> {
        self.state.flavors.insert(flavor.id, flavor);
        Ok(())
    }

    pub fn create_server_group(&mut self, group: ServerGroup) -> Result<()> {
        self.state.server_groups.insert(group.id, group);
        Ok(())
    }

    pub fn add_server_group_member(&mut self, group_id: EntityId, consumer_id: EntityId) -> Result<()> {
        let g = self
            .state
            .server_groups
            .get_mut(&group_id)
            .ok_or_else(|| TachyonError::not_found("ServerGroup", group_id.to_string()))?;
        if !g.members.contains(&consumer_id) {
            g.members.push(consumer_id);
        }
        Ok(())
    }

    /// Upserts a `shares_resources` edge by its `(source, target)` pair:
    /// a second call for the same pair unions the contributed classes into
    /// the existing edge instead of pushing a duplicate, so a re-run (e.g.
    /// a retried migration import) can never double-count a sharing
    /// provider's contributed capacity.
    pub fn create_shares_resources(&mut self, edge: SharesResources) -> Result<()> {
        if !self.state.providers.contains_key(&edge.source_provider_id)
            || !self.state.providers.contains_key(&edge.target_provider_id)
        {
            return Err(TachyonError::bad_request("shares_resources edge references unknown provider"));
        }
        if let Some(existing) = self.state.shares.iter_mut().find(|e| {
            e.source_provider_id == edge.source_provider_id && e.target_provider_id == edge.target_provider_id
        }) {
            existing.classes.extend(edge.classes);
        } else {
            self.state.shares.push(edge);
        }
        Ok(())
    }
}

fn schema_err(v: schema::SchemaViolation) -> TachyonError {
    match v {
        schema::SchemaViolation::DuplicateName(n) => {
            TachyonError::ConflictUniqueness { kind: "name", detail: n }
        }
        schema::SchemaViolation::DuplicateUuid(id) => {
            TachyonError::ConflictUniqueness { kind: "uuid", detail: id.to_string() }
        }
        schema::SchemaViolation::DuplicateInventory(id, class) => TachyonError::ConflictUniqueness {
            kind: "inventory",
            detail: format!("{id}/{class:?}"),
        },
        other => TachyonError::BadRequest { detail: other.to_string() },
    }
}

/// The in-memory `GraphStore` adapter. Holds the entire graph behind
/// one async mutex, satisfying "serializable per session" by construction:
/// only one transaction runs at a time.
pub struct MemoryGraphStore {
    inner: Mutex<GraphState>,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(GraphState::default()) }
    }

    /// Read-only access to a snapshot. No rollback bookkeeping needed since
    /// the closure cannot mutate state.
    pub async fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&GraphState) -> T,
    {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Runs `f` against a live `GraphWriter`. On `Ok`, the mutation stands.
    /// On `Err`, the pre-transaction snapshot is restored so no partial
    /// write is ever observed.
    pub async fn run_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut GraphWriter) -> Result<T>,
    {
        let mut guard = self.inner.lock().await;
        let snapshot = guard.clone();
        let mut writer = GraphWriter { state: &mut guard };
        match f(&mut writer) {
            Ok(value) => Ok(value),
            Err(err) => {
                *guard = snapshot;
                debug!(error = %err, "transaction rolled back to pre-write snapshot");
                Err(err)
            }
        }
    }

    pub async fn global_generation(&self) -> Generation {
        self.read(|s| s.global_generation).await
    }
}
