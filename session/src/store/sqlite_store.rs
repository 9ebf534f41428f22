//! SQLiteSimulationStore
//! ---------------------
//! SQLite-backed implementation of the `SimulationStore` trait, shaped
//! after the bot's own session persistence: schema creation on startup,
//! manual row (de)serialization, upsert on `save`, hard delete on
//! `delete`. The delta log and base generation do not get their own
//! columns per field; they are compact enough to round-trip as JSON
//! blobs without losing queryability anyone actually needs (no query in
//! this crate filters on delta contents).

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::SimulationStore;
use crate::model::{SessionId, SimulationSession, SimulationStatus, SpeculativeDelta};

pub struct SQLiteSimulationStore {
    pool: SqlitePool,
}

impl SQLiteSimulationStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(path: &str) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(path).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS simulation_sessions (
                id TEXT PRIMARY KEY,
                base_generation INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER,
                status TEXT NOT NULL,
                deltas_json TEXT NOT NULL
            );
        "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SimulationStore for SQLiteSimulationStore {
    /// Called once at startup to reconstruct the in-memory live session
    /// set. Sessions left `Active` past their deadline are reconciled by
    /// the manager's own sweep, not here.
    async fn load_all(&self) -> anyhow::Result<Vec<SimulationSession>> {
        let rows = sqlx::query("SELECT * FROM simulation_sessions")
            .fetch_all(&self.pool)
            .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.get("id");
            let id = uuid::Uuid::parse_str(&id_str)?;

            let base_generation = row.get::<i64, _>("base_generation") as u64;
            let created_at_ms = row.get::<i64, _>("created_at_ms") as u64;
            let expires_at_ms = row.get::<Option<i64>, _>("expires_at_ms").map(|v| v as u64);

            let status_str: String = row.get("status");
            let status = SimulationStatus::from_str(&status_str)
                .map_err(|e| anyhow::anyhow!("invalid simulation status '{}': {}", status_str, e))?;

            let deltas_json: String = row.get("deltas_json");
            let deltas: Vec<SpeculativeDelta> = serde_json::from_str(&deltas_json)
                .map_err(|e| anyhow::anyhow!("invalid deltas JSON '{}': {}", deltas_json, e))?;

            sessions.push(SimulationSession {
                id,
                base_generation: common::Generation(base_generation),
                created_at_ms,
                expires_at_ms,
                status,
                deltas,
            });
        }

        Ok(sessions)
    }

    async fn save(&self, session: &SimulationSession) -> anyhow::Result<()> {
        let deltas_json = serde_json::to_string(&session.deltas)?;

        sqlx::query(
            r#"
            INSERT INTO simulation_sessions (
                id, base_generation, created_at_ms, expires_at_ms, status, deltas_json
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                base_generation = excluded.base_generation,
                created_at_ms = excluded.created_at_ms,
                expires_at_ms = excluded.expires_at_ms,
                status = excluded.status,
                deltas_json = excluded.deltas_json;
        "#,
        )
        .bind(session.id.to_string())
        .bind(session.base_generation.0 as i64)
        .bind(session.created_at_ms as i64)
        .bind(session.expires_at_ms.map(|v| v as i64))
        .bind(session.status.to_string())
        .bind(deltas_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, session_id: SessionId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM simulation_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
