//! Simulation subsystem data model.
//!
//! `SimulationSession` generalizes a `Created → ... →
//! Completed/Cancelled/Expired`-style lifecycle into
//! `Active → Committed/RolledBack/Expired`: an append-only log of
//! `SpeculativeDelta` records layered over the live graph, rather than a
//! single mutable progress counter.

use std::fmt;
use std::str::FromStr;

use common::{EntityId, Generation};
use graph::model::ResourceClass;
use serde::{Deserialize, Serialize};

pub type SessionId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationStatus {
    Active,
    Committed,
    RolledBack,
    Expired,
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulationStatus::Active => "Active",
            SimulationStatus::Committed => "Committed",
            SimulationStatus::RolledBack => "RolledBack",
            SimulationStatus::Expired => "Expired",
        };
        f.write_str(s)
    }
}

impl FromStr for SimulationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(SimulationStatus::Active),
            "Committed" => Ok(SimulationStatus::Committed),
            "RolledBack" => Ok(SimulationStatus::RolledBack),
            "Expired" => Ok(SimulationStatus::Expired),
            other => Err(anyhow::anyhow!("invalid SimulationStatus value: {other}")),
        }
    }
}

/// One speculative operation in a session's ordered delta log. `sequence`
/// is strictly monotone within one session and meaningless across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeDelta {
    pub sequence: u64,
    pub consumer_id: EntityId,
    pub kind: DeltaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeltaKind {
    Move {
        from_provider: EntityId,
        to_provider: EntityId,
        /// Resources the consumer holds on `from_provider`, carried so the
        /// delta log alone is enough to fold virtual usage without
        /// re-reading live state for every class.
        resources: Vec<(ResourceClass, u64)>,
    },
    Allocate {
        provider: EntityId,
        resources: Vec<(ResourceClass, u64)>,
    },
    Deallocate {
        provider: EntityId,
        resources: Vec<(ResourceClass, u64)>,
    },
}

/// A speculative workspace layered over the live graph.
#[derive(Debug, Clone)]
pub struct SimulationSession {
    pub id: SessionId,
    pub base_generation: Generation,
    pub created_at_ms: u64,
    pub expires_at_ms: Option<u64>,
    pub status: SimulationStatus,
    pub deltas: Vec<SpeculativeDelta>,
}

impl SimulationSession {
    pub fn new(id: SessionId, base_generation: Generation, created_at_ms: u64, ttl_ms: Option<u64>) -> Self {
        Self {
            id,
            base_generation,
            created_at_ms,
            expires_at_ms: ttl_ms.map(|ttl| created_at_ms + ttl),
            status: SimulationStatus::Active,
            deltas: Vec::new(),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at_ms {
            Some(expiry) => now_ms >= expiry,
            None => false,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.deltas.last().map(|d| d.sequence + 1).unwrap_or(0)
    }

    /// The effective current provider for `consumer_id` within this
    /// session's overlay: the `to_provider` of the last prior `move` delta
    /// for that consumer, or `None` if no move has been recorded (the
    /// caller falls back to the consumer's live provider).
    pub fn effective_source(&self, consumer_id: EntityId) -> Option<EntityId> {
        self.deltas
            .iter()
            .rev()
            .find_map(|d| match &d.kind {
                DeltaKind::Move { to_provider, .. } if d.consumer_id == consumer_id => Some(*to_provider),
                _ => None,
            })
    }
}
