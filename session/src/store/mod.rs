pub mod sqlite_store;

use crate::model::{SessionId, SimulationSession};

#[async_trait::async_trait]
pub trait SimulationStore: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<SimulationSession>>;
    async fn save(&self, session: &SimulationSession) -> anyhow::Result<()>;
    async fn delete(&self, session_id: SessionId) -> anyhow::Result<()>;
}
