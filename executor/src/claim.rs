//! Claim executor.
//!
//! `ClaimExecutor` mirrors `executor::SwapBuilder`'s trait-plus-async-impl
//! shape: one transactional method, one concrete implementation wired to
//! the graph store. No retry loop lives here — retry budgets belong in
//! the caller.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Generation, Result, TachyonError};
use graph::model::Consumer;
use graph::store::MemoryGraphStore;
use scheduler::capacity::{self, NoOverlay};
use tracing::{info, warn};

use crate::types::{ClaimOutcome, ClaimRequest};

#[async_trait]
pub trait ClaimExecutor: Send + Sync {
    /// Converts a candidate/claim request into durable state. Returns
    /// `ConflictGeneration` on any stale expected generation,
    /// `OutOfCapacity` if a concurrent claim already ate the headroom.
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome>;
}

pub struct GraphClaimExecutor {
    store: Arc<MemoryGraphStore>,
}

impl GraphClaimExecutor {
    pub fn new(store: Arc<MemoryGraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ClaimExecutor for GraphClaimExecutor {
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome> {
        if request.allocations.is_empty() {
            return Err(TachyonError::bad_request("claim request carries no allocations"));
        }

        let consumer_id = request.consumer_id;
        let replace_prior = request.replace_prior;

        let result = self
            .store
            .run_transaction(move |w| {
                let state = w.read();

                // Step 1: verify every expected generation still matches.
                for (provider_id, expected_gen) in &request.expected.providers {
                    let current = state
                        .provider(*provider_id)
                        .ok_or_else(|| TachyonError::not_found("ResourceProvider", provider_id.to_string()))?
                        .generation;
                    if !current.matches(*expected_gen) {
                        return Err(TachyonError::ConflictGeneration {
                            kind: "ResourceProvider",
                            id: provider_id.to_string(),
                            expected: expected_gen.0,
                            found: current.0,
                        });
                    }
                }

                let existing_consumer_gen = state.consumer(consumer_id).map(|c| c.generation);
                match (existing_consumer_gen, request.expected.consumer) {
                    (Some(current), Some(expected)) if !current.matches(expected) => {
                        return Err(TachyonError::ConflictGeneration {
                            kind: "Consumer",
                            id: consumer_id.to_string(),
                            expected: expected.0,
                            found: current.0,
                        });
                    }
                    (Some(_), None) => {
                        return Err(TachyonError::bad_request(
                            "consumer already exists but claim expected a new consumer",
                        ));
                    }
                    _ => {}
                }

                // Step 2: re-verify capacity against current state. A
                // concurrent claim may have consumed the headroom this
                // candidate was planned against.
                for alloc in &request.allocations {
                    let inv = state
                        .inventory(alloc.resource_provider_id, &alloc.resource_class)
                        .ok_or_else(|| {
                            TachyonError::not_found("Inventory", alloc.resource_provider_id.to_string())
                        })?;
                    let already_theirs = state
                        .allocations_of_consumer(consumer_id)
                        .iter()
                        .find(|a| a.resource_provider_id == alloc.resource_provider_id && a.resource_class == alloc.resource_class)
                        .map(|a| a.used)
                        .unwrap_or(0);
                    let live_used = if request.replace_prior {
                        state.used(alloc.resource_provider_id, &alloc.resource_class) - already_theirs
                    } else {
                        state.used(alloc.resource_provider_id, &alloc.resource_class)
                    };
                    if !capacity::is_feasible(inv, alloc.used, live_used, &NoOverlay) {
                        return Err(TachyonError::out_of_capacity(format!(
                            "provider {} class {:?} cannot fit {}",
                            alloc.resource_provider_id, alloc.resource_class, alloc.used
                        )));
                    }
                }

                // Steps 3-4: upsert consumer first so subsequent generation
                // bumps on it land on a real record, then (re)write the
                // consumes edges.
                w.upsert_consumer(Consumer {
                    id: consumer_id,
                    generation: existing_consumer_gen.unwrap_or(Generation::INITIAL),
                    project_id: request.project_id,
                    user_id: request.user_id,
                    consumer_type: request.consumer_type.clone(),
                })?;

                if request.replace_prior {
                    w.replace_allocations(consumer_id, request.allocations.clone())?;
                } else {
                    for alloc in &request.allocations {
                        w.record_allocation(alloc.clone())?;
                    }
                }

                // Step 5: generation bumps happen inside the write methods
                // above; the global generation is already bumped by the
                // same calls, in the same transaction.
                let global_generation = w.read().global_generation;
                Ok(ClaimOutcome { consumer_id, global_generation })
            })
            .await;

        match &result {
            Ok(outcome) => info!(%consumer_id, replace_prior, global_generation = outcome.global_generation.0, "claim committed"),
            Err(TachyonError::ConflictGeneration { kind, id, .. }) => {
                warn!(%consumer_id, conflict_kind = kind, conflict_id = %id, "claim rejected on stale generation")
            }
            Err(TachyonError::OutOfCapacity { .. }) => {
                warn!(%consumer_id, "claim rejected, concurrent claim already consumed capacity")
            }
            Err(e) => warn!(%consumer_id, error = %e, "claim failed"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EntityId;
    use graph::model::{Allocation, Inventory, ProviderRole, ResourceClass, StandardResourceClass};
    use std::collections::HashSet;

    async fn host_with_vcpu(store: &MemoryGraphStore, total: u64) -> (EntityId, Generation) {
        let id = EntityId::new_v4();
        store
            .run_transaction(|w| {
                w.create_provider(id, "H1".into(), None, HashSet::from([ProviderRole::ComputeHost]))?;
                w.set_inventory(Inventory {
                    resource_provider_id: id,
                    resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                    total,
                    reserved: 0,
                    min_unit: 1,
                    max_unit: total,
                    step_size: 1,
                    allocation_ratio: 1.0,
                })
            })
            .await
            .unwrap();
        let gen = store.read(|s| s.provider(id).unwrap().generation).await;
        (id, gen)
    }

    #[tokio::test]
    async fn claim_succeeds_and_bumps_generations() {
        let store = Arc::new(MemoryGraphStore::new());
        let (host, host_gen) = host_with_vcpu(&store, 8).await;
        let executor = GraphClaimExecutor::new(store.clone());

        let consumer_id = EntityId::new_v4();
        let mut expected = crate::types::ExpectedGenerations::default();
        expected.providers.insert(host, host_gen);

        let request = ClaimRequest {
            consumer_id,
            project_id: EntityId::new_v4(),
            user_id: EntityId::new_v4(),
            consumer_type: "INSTANCE".into(),
            allocations: vec![Allocation {
                consumer_id,
                resource_provider_id: host,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                used: 4,
                created_at_ms: 0,
                updated_at_ms: 0,
            }],
            replace_prior: false,
            expected,
        };

        let outcome = executor.claim(request).await.unwrap();
        assert_eq!(outcome.consumer_id, consumer_id);

        let new_host_gen = store.read(|s| s.provider(host).unwrap().generation).await;
        assert!(new_host_gen > host_gen);
    }

    #[tokio::test]
    async fn stale_provider_generation_is_rejected() {
        let store = Arc::new(MemoryGraphStore::new());
        let (host, host_gen) = host_with_vcpu(&store, 8).await;
        let executor = GraphClaimExecutor::new(store.clone());

        let consumer_id = EntityId::new_v4();
        let mut expected = crate::types::ExpectedGenerations::default();
        expected.providers.insert(host, host_gen.bumped()); // wrong on purpose

        let request = ClaimRequest {
            consumer_id,
            project_id: EntityId::new_v4(),
            user_id: EntityId::new_v4(),
            consumer_type: "INSTANCE".into(),
            allocations: vec![Allocation {
                consumer_id,
                resource_provider_id: host,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                used: 4,
                created_at_ms: 0,
                updated_at_ms: 0,
            }],
            replace_prior: false,
            expected,
        };

        let err = executor.claim(request).await.unwrap_err();
        assert!(matches!(err, TachyonError::ConflictGeneration { .. }));
    }

    #[tokio::test]
    async fn concurrent_overclaim_returns_out_of_capacity() {
        let store = Arc::new(MemoryGraphStore::new());
        let (host, host_gen) = host_with_vcpu(&store, 8).await;
        let executor = GraphClaimExecutor::new(store.clone());

        // Pre-existing consumer already uses all 8.
        let prior_consumer = EntityId::new_v4();
        store
            .run_transaction(|w| {
                w.upsert_consumer(Consumer {
                    id: prior_consumer,
                    generation: Generation::INITIAL,
                    project_id: EntityId::new_v4(),
                    user_id: EntityId::new_v4(),
                    consumer_type: "INSTANCE".into(),
                })?;
                w.record_allocation(Allocation {
                    consumer_id: prior_consumer,
                    resource_provider_id: host,
                    resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                    used: 8,
                    created_at_ms: 0,
                    updated_at_ms: 0,
                })
            })
            .await
            .unwrap();

        let consumer_id = EntityId::new_v4();
        let mut expected = crate::types::ExpectedGenerations::default();
        expected.providers.insert(host, host_gen);

        let request = ClaimRequest {
            consumer_id,
            project_id: EntityId::new_v4(),
            user_id: EntityId::new_v4(),
            consumer_type: "INSTANCE".into(),
            allocations: vec![Allocation {
                consumer_id,
                resource_provider_id: host,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                used: 1,
                created_at_ms: 0,
                updated_at_ms: 0,
            }],
            replace_prior: false,
            expected,
        };

        let err = executor.claim(request).await.unwrap_err();
        assert!(matches!(err, TachyonError::OutOfCapacity { .. }));
    }
}
