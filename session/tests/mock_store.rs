use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use session::model::{SessionId, SimulationSession};
use session::store::SimulationStore;

/// An in-memory `SimulationStore`, shared across the integration tests in
/// this crate the way the bot's own integration suite swaps in a mock
/// repository instead of standing up SQLite for every lifecycle test.
#[derive(Default)]
pub struct InMemorySimulationStore {
    pub map: Arc<Mutex<HashMap<SessionId, SimulationSession>>>,
}

#[async_trait]
impl SimulationStore for InMemorySimulationStore {
    async fn load_all(&self) -> anyhow::Result<Vec<SimulationSession>> {
        Ok(self.map.lock().await.values().cloned().collect())
    }

    async fn save(&self, session: &SimulationSession) -> anyhow::Result<()> {
        self.map.lock().await.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.map.lock().await.remove(&session_id);
        Ok(())
    }
}
