use uuid::Uuid;

use common::Generation;
use session::model::{DeltaKind, SimulationSession, SimulationStatus, SpeculativeDelta};
use session::store::sqlite_store::SQLiteSimulationStore;
use session::store::SimulationStore;

/// Test suite for `SQLiteSimulationStore`, covering schema creation, the
/// save-as-upsert path, enum round-tripping, and deletion against a real
/// SQLite connection.
fn sample_session() -> SimulationSession {
    let mut s = SimulationSession::new(Uuid::new_v4(), Generation(3), 1_000, Some(60_000));
    s.deltas.push(SpeculativeDelta {
        sequence: 0,
        consumer_id: Uuid::new_v4(),
        kind: DeltaKind::Allocate {
            provider: Uuid::new_v4(),
            resources: vec![(graph::model::ResourceClass::Standard(graph::model::StandardResourceClass::Vcpu), 4)],
        },
    });
    s
}

async fn open_store() -> SQLiteSimulationStore {
    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
    SQLiteSimulationStore::new(&conn_str).await.unwrap()
}

#[tokio::test]
async fn save_then_load_all_round_trips_the_session() {
    let store = open_store().await;
    let session = sample_session();
    store.save(&session).await.unwrap();

    let loaded = store.load_all().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, session.id);
    assert_eq!(loaded[0].base_generation, session.base_generation);
    assert_eq!(loaded[0].status, SimulationStatus::Active);
    assert_eq!(loaded[0].deltas.len(), 1);
}

#[tokio::test]
async fn save_twice_upserts_rather_than_duplicating() {
    let store = open_store().await;
    let mut session = sample_session();
    store.save(&session).await.unwrap();

    session.status = SimulationStatus::Committed;
    session.deltas.clear();
    store.save(&session).await.unwrap();

    let loaded = store.load_all().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].status, SimulationStatus::Committed);
    assert!(loaded[0].deltas.is_empty());
}

#[tokio::test]
async fn delete_removes_the_row() {
    let store = open_store().await;
    let session = sample_session();
    store.save(&session).await.unwrap();

    store.delete(session.id).await.unwrap();

    let loaded = store.load_all().await.unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn load_all_returns_every_session_status() {
    let store = open_store().await;
    let mut rolled_back = sample_session();
    rolled_back.status = SimulationStatus::RolledBack;
    let active = sample_session();

    store.save(&rolled_back).await.unwrap();
    store.save(&active).await.unwrap();

    let loaded = store.load_all().await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().any(|s| s.status == SimulationStatus::RolledBack));
    assert!(loaded.iter().any(|s| s.status == SimulationStatus::Active));
}
