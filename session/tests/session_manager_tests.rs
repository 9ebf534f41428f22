use std::collections::HashSet;
use std::sync::Arc;

use tokio::test;

use common::{Clock, EntityId, FakeClock, Generation};
use graph::model::{Consumer, Inventory, ProviderRole, ResourceClass, StandardResourceClass};
use graph::store::MemoryGraphStore;
use session::manager::SimulationManager;

mod mock_store;
use mock_store::InMemorySimulationStore;

async fn host_with_vcpu(graph: &MemoryGraphStore, total: u64) -> EntityId {
    let id = EntityId::new_v4();
    graph
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
    id
}

async fn new_manager(store: Arc<InMemorySimulationStore>, graph: Arc<MemoryGraphStore>) -> SimulationManager<InMemorySimulationStore> {
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
    SimulationManager::new(store, graph, clock).await.unwrap()
}

#[test]
async fn restore_from_store_loads_pending_sessions() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());

    let mgr = new_manager(store.clone(), graph.clone()).await;
    let id = mgr.create_session(None).await?;

    // A second manager over the same store picks the session back up.
    let mgr2 = new_manager(store, graph).await;
    assert!(mgr2.get_session(id).await.is_some());

    Ok(())
}

#[test]
async fn record_move_tracks_effective_placement() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host_a = host_with_vcpu(&graph, 8).await;
    let host_b = EntityId::new_v4();
    graph
        .run_transaction(|w| w.create_provider(host_b, "H2".into(), None, HashSet::from([ProviderRole::ComputeHost])))
        .await?;

    let consumer_id = EntityId::new_v4();
    graph
        .run_transaction(|w| {
            w.upsert_consumer(Consumer {
                id: consumer_id,
                generation: Generation::INITIAL,
                project_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                consumer_type: "INSTANCE".into(),
            })?;
            w.record_allocation(graph::model::Allocation {
                consumer_id,
                resource_provider_id: host_a,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                used: 4,
                created_at_ms: 0,
                updated_at_ms: 0,
            })
        })
        .await?;

    let mgr = new_manager(store, graph).await;
    let session_id = mgr.create_session(None).await?;

    assert_eq!(mgr.effective_placement(session_id, consumer_id).await?, Some(host_a));

    mgr.record_move(
        session_id,
        consumer_id,
        host_a,
        host_b,
        vec![(ResourceClass::Standard(StandardResourceClass::Vcpu), 4)],
    )
    .await?;

    assert_eq!(mgr.effective_placement(session_id, consumer_id).await?, Some(host_b));

    Ok(())
}

#[test]
async fn undo_last_pops_the_most_recent_delta() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host = host_with_vcpu(&graph, 8).await;
    let consumer_id = EntityId::new_v4();
    let class = ResourceClass::Standard(StandardResourceClass::Vcpu);

    let mgr = new_manager(store, graph).await;
    let session_id = mgr.create_session(None).await?;

    mgr.record_allocate(session_id, consumer_id, host, vec![(class.clone(), 2)]).await?;
    mgr.record_allocate(session_id, consumer_id, host, vec![(class.clone(), 3)]).await?;
    assert_eq!(mgr.virtual_usage(session_id, host, &class).await?, 5);

    let popped = mgr.undo_last(session_id).await?;
    assert!(popped.is_some());
    assert_eq!(mgr.virtual_usage(session_id, host, &class).await?, 2);

    Ok(())
}

#[test]
async fn rollback_discards_overlay_without_touching_live_graph() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host = host_with_vcpu(&graph, 8).await;
    let consumer_id = EntityId::new_v4();
    let class = ResourceClass::Standard(StandardResourceClass::Vcpu);

    let mgr = new_manager(store, graph.clone()).await;
    let session_id = mgr.create_session(None).await?;
    mgr.record_allocate(session_id, consumer_id, host, vec![(class.clone(), 4)]).await?;

    mgr.rollback(session_id).await?;

    assert!(mgr.get_session(session_id).await.is_none());
    let live_used = graph.read(|s| s.used(host, &class)).await;
    assert_eq!(live_used, 0);

    Ok(())
}

#[test]
async fn sweep_expires_sessions_past_their_ttl() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());

    let mgr = new_manager(store, graph).await;
    let session_id = mgr.create_session(Some(1000)).await?;

    mgr.sweep(500).await;
    assert!(mgr.get_session(session_id).await.is_some());

    mgr.sweep(2000).await;
    assert!(mgr.get_session(session_id).await.is_none());

    Ok(())
}

#[test]
async fn metrics_computes_utilization_ratio_from_virtual_usage() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host = host_with_vcpu(&graph, 8).await;
    let consumer_id = EntityId::new_v4();
    let class = ResourceClass::Standard(StandardResourceClass::Vcpu);

    let mgr = new_manager(store, graph).await;
    let session_id = mgr.create_session(None).await?;
    mgr.record_allocate(session_id, consumer_id, host, vec![(class.clone(), 4)]).await?;

    let stats = mgr.metrics(session_id, host, &[class]).await?.unwrap();
    assert_eq!(stats.mean, 0.5);

    Ok(())
}

// Simulation round-trip: a move's virtual usage is visible on both
// endpoints, its metrics diverge from live metrics while the session is
// open, and after commit live state matches what the session predicted.
#[test]
async fn simulation_round_trip_move_matches_live_state_after_commit() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host_a = host_with_vcpu(&graph, 8).await;
    let host_b = EntityId::new_v4();
    graph
        .run_transaction(|w| w.create_provider(host_b, "H2".into(), None, HashSet::from([ProviderRole::ComputeHost])))
        .await?;
    graph
        .run_transaction(|w| {
            w.set_inventory(Inventory {
                resource_provider_id: host_b,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                total: 8,
                reserved: 0,
                min_unit: 1,
                max_unit: 8,
                step_size: 1,
                allocation_ratio: 1.0,
            })
        })
        .await?;

    let consumer_id = EntityId::new_v4();
    let class = ResourceClass::Standard(StandardResourceClass::Vcpu);
    graph
        .run_transaction(|w| {
            w.upsert_consumer(Consumer {
                id: consumer_id,
                generation: Generation::INITIAL,
                project_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                consumer_type: "INSTANCE".into(),
            })?;
            w.record_allocation(graph::model::Allocation {
                consumer_id,
                resource_provider_id: host_a,
                resource_class: ResourceClass::Standard(StandardResourceClass::Vcpu),
                used: 4,
                created_at_ms: 0,
                updated_at_ms: 0,
            })
        })
        .await?;

    let mgr = new_manager(store, graph.clone()).await;
    let session_id = mgr.create_session(None).await?;

    mgr.record_move(session_id, consumer_id, host_a, host_b, vec![(class.clone(), 4)]).await?;

    // virtual_usage drops on H1 and rises on H2 by the moved footprint,
    // while live state is untouched.
    assert_eq!(mgr.virtual_usage(session_id, host_a, &class).await?, 0);
    assert_eq!(mgr.virtual_usage(session_id, host_b, &class).await?, 4);
    assert_eq!(graph.read(|s| s.used(host_a, &class)).await, 4);
    assert_eq!(graph.read(|s| s.used(host_b, &class)).await, 0);

    // Metrics diverge between the session's virtual view and live state.
    let diff = mgr.metrics_diff(session_id, None, host_b, std::slice::from_ref(&class)).await?.unwrap();
    assert!(diff.mean > 0.0);

    mgr.commit(session_id).await.map_err(|e| anyhow::anyhow!(e))?;

    assert_eq!(graph.read(|s| s.used(host_a, &class)).await, 0);
    assert_eq!(graph.read(|s| s.used(host_b, &class)).await, 4);
    assert!(mgr.get_session(session_id).await.is_none());

    Ok(())
}

#[test]
async fn commit_removes_session_from_status_active_set() -> anyhow::Result<()> {
    let graph = Arc::new(MemoryGraphStore::new());
    let store = Arc::new(InMemorySimulationStore::default());
    let host = host_with_vcpu(&graph, 8).await;
    let consumer_id = EntityId::new_v4();
    graph
        .run_transaction(|w| {
            w.upsert_consumer(Consumer {
                id: consumer_id,
                generation: Generation::INITIAL,
                project_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                consumer_type: "INSTANCE".into(),
            })
        })
        .await?;

    let mgr = new_manager(store, graph).await;
    let session_id = mgr.create_session(None).await?;
    mgr.record_allocate(
        session_id,
        consumer_id,
        host,
        vec![(ResourceClass::Standard(StandardResourceClass::Vcpu), 2)],
    )
    .await?;

    mgr.commit(session_id).await.map_err(|e| anyhow::anyhow!(e))?;
    assert!(mgr.get_session(session_id).await.is_none());

    Ok(())
}
