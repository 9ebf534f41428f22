use std::collections::HashMap;
use std::sync::Arc;

use common::{Clock, EntityId, Result as TachyonResult, TachyonError};
use graph::model::{Allocation, ResourceClass};
use graph::store::MemoryGraphStore;
use scheduler::capacity::{self, CapacityOverlay, NoOverlay};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::{compute_stats, diff_stats, UtilizationStats, UtilizationStatsDiff};
use crate::model::{DeltaKind, SessionId, SimulationSession, SimulationStatus, SpeculativeDelta};
use crate::overlay::{self, SessionOverlay};
use crate::store::SimulationStore;

/// Manages the in-memory live set of simulation sessions, persisting
/// every mutation to a store and folding each session's delta log over
/// the live graph to answer virtual-capacity questions without a second
/// code path.
pub struct SimulationManager<S: SimulationStore> {
    sessions: Arc<Mutex<HashMap<SessionId, SimulationSession>>>,
    store: Arc<S>,
    graph: Arc<MemoryGraphStore>,
    clock: Arc<dyn Clock>,
}

impl<S: SimulationStore> SimulationManager<S> {
    pub async fn new(store: Arc<S>, graph: Arc<MemoryGraphStore>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let manager = Self { sessions: Arc::new(Mutex::new(HashMap::new())), store, graph, clock };
        manager.restore_from_store().await?;
        Ok(manager)
    }

    async fn restore_from_store(&self) -> anyhow::Result<()> {
        let all = self.store.load_all().await?;
        let mut sessions = self.sessions.lock().await;
        for s in all {
            sessions.insert(s.id, s);
        }
        Ok(())
    }

    pub async fn create_session(&self, ttl_ms: Option<u64>) -> anyhow::Result<SessionId> {
        let id = Uuid::new_v4();
        let base_generation = self.graph.global_generation().await;
        let now = self.clock.now_ms();
        let session = SimulationSession::new(id, base_generation, now, ttl_ms);

        self.store.save(&session).await?;
        self.sessions.lock().await.insert(id, session);
        Ok(id)
    }

    async fn session_snapshot(&self, session_id: SessionId) -> anyhow::Result<SimulationSession> {
        let guard = self.sessions.lock().await;
        guard.get(&session_id).cloned().ok_or_else(|| anyhow::anyhow!("simulation session not found"))
    }

    async fn append_delta(&self, session_id: SessionId, consumer_id: EntityId, kind: DeltaKind) -> anyhow::Result<()> {
        let mut guard = self.sessions.lock().await;
        let session = guard
            .get_mut(&session_id)
            .ok_or_else(|| anyhow::anyhow!("simulation session not found"))?;

        if session.status != SimulationStatus::Active {
            anyhow::bail!("simulation session is not active");
        }

        let sequence = session.next_sequence();
        session.deltas.push(SpeculativeDelta { sequence, consumer_id, kind });
        self.store.save(session).await?;
        Ok(())
    }

    /// Checks that `amount` still fits `class`'s inventory on `provider_id`
    /// once `session`'s already-recorded deltas (not including the one
    /// about to be appended) are folded in.
    async fn check_destination_capacity(
        &self,
        session: &SimulationSession,
        provider_id: EntityId,
        class: &ResourceClass,
        amount: u64,
    ) -> anyhow::Result<()> {
        let inv = self
            .graph
            .read(move |s| s.inventory(provider_id, class).cloned())
            .await
            .ok_or_else(|| anyhow::anyhow!("no inventory for provider {provider_id} class {class:?}"))?;
        let live_used = self.graph.read(move |s| s.used(provider_id, class)).await;
        let overlay_delta = SessionOverlay::new(session).delta_used(provider_id, class);
        let current_used = (live_used as i64 + overlay_delta).max(0) as u64;
        if !capacity::is_feasible(&inv, amount, current_used, &NoOverlay) {
            anyhow::bail!(
                "provider {provider_id} class {class:?} cannot fit {amount} under this session's overlay \
                 ({current_used} already used of {})",
                inv.effective_capacity()
            );
        }
        Ok(())
    }

    /// Validates that the effective source for `consumer_id` equals
    /// `from_provider` (the last prior `move` target in this session, or
    /// the consumer's live provider if this session has not yet moved it),
    /// then that `to_provider` has room under the current overlay, before
    /// appending the `move` delta.
    pub async fn record_move(
        &self,
        session_id: SessionId,
        consumer_id: EntityId,
        from_provider: EntityId,
        to_provider: EntityId,
        resources: Vec<(ResourceClass, u64)>,
    ) -> anyhow::Result<()> {
        let snapshot = self.session_snapshot(session_id).await?;

        let effective_source = match snapshot.effective_source(consumer_id) {
            Some(src) => Some(src),
            None => {
                self.graph
                    .read(move |s| {
                        s.allocations_of_consumer(consumer_id)
                            .iter()
                            .find(|a| a.resource_provider_id == from_provider)
                            .map(|a| a.resource_provider_id)
                    })
                    .await
            }
        };
        if effective_source != Some(from_provider) {
            anyhow::bail!(
                "consumer {consumer_id}'s effective source does not match from_provider {from_provider}"
            );
        }

        for (class, amount) in &resources {
            let live = self
                .graph
                .read(move |s| {
                    s.allocations_of_consumer(consumer_id)
                        .iter()
                        .find(|a| a.resource_provider_id == from_provider && &a.resource_class == class)
                        .map(|a| a.used)
                        .unwrap_or(0)
                })
                .await as i64;
            let overlay_delta = overlay::consumer_net_delta(&snapshot, consumer_id, from_provider, class);
            let held = (live + overlay_delta).max(0) as u64;
            if held < *amount {
                anyhow::bail!(
                    "consumer {consumer_id} holds only {held} of class {class:?} on provider {from_provider}, cannot move {amount}"
                );
            }
            self.check_destination_capacity(&snapshot, to_provider, class, *amount).await?;
        }

        self.append_delta(session_id, consumer_id, DeltaKind::Move { from_provider, to_provider, resources }).await
    }

    /// Validates destination capacity under the current overlay, then
    /// appends the `allocate` delta.
    pub async fn record_allocate(
        &self,
        session_id: SessionId,
        consumer_id: EntityId,
        provider: EntityId,
        resources: Vec<(ResourceClass, u64)>,
    ) -> anyhow::Result<()> {
        let snapshot = self.session_snapshot(session_id).await?;
        for (class, amount) in &resources {
            self.check_destination_capacity(&snapshot, provider, class, *amount).await?;
        }
        self.append_delta(session_id, consumer_id, DeltaKind::Allocate { provider, resources }).await
    }

    /// Validates that `consumer_id` actually holds at least `amount` of
    /// each class on `provider` under the current overlay, then appends
    /// the `deallocate` delta.
    pub async fn record_deallocate(
        &self,
        session_id: SessionId,
        consumer_id: EntityId,
        provider: EntityId,
        resources: Vec<(ResourceClass, u64)>,
    ) -> anyhow::Result<()> {
        let snapshot = self.session_snapshot(session_id).await?;
        for (class, amount) in &resources {
            let live = self
                .graph
                .read(move |s| {
                    s.allocations_of_consumer(consumer_id)
                        .iter()
                        .find(|a| a.resource_provider_id == provider && &a.resource_class == class)
                        .map(|a| a.used)
                        .unwrap_or(0)
                })
                .await as i64;
            let overlay_delta = overlay::consumer_net_delta(&snapshot, consumer_id, provider, class);
            let held = (live + overlay_delta).max(0) as u64;
            if held < *amount {
                anyhow::bail!(
                    "consumer {consumer_id} holds only {held} of class {class:?} on provider {provider}, cannot deallocate {amount}"
                );
            }
        }
        self.append_delta(session_id, consumer_id, DeltaKind::Deallocate { provider, resources }).await
    }

    /// Pops the last delta off the log. Returns `None` if the log is
    /// already empty.
    pub async fn undo_last(&self, session_id: SessionId) -> anyhow::Result<Option<SpeculativeDelta>> {
        let mut guard = self.sessions.lock().await;
        let session = guard
            .get_mut(&session_id)
            .ok_or_else(|| anyhow::anyhow!("simulation session not found"))?;

        if session.status != SimulationStatus::Active {
            anyhow::bail!("simulation session is not active");
        }

        let popped = session.deltas.pop();
        self.store.save(session).await?;
        Ok(popped)
    }

    /// Folds the session's delta log over the live `used` figure for one
    /// provider/class, without mutating the live graph.
    pub async fn virtual_usage(&self, session_id: SessionId, provider_id: EntityId, class: &ResourceClass) -> anyhow::Result<u64> {
        let base = self.graph.read(|s| s.used(provider_id, class)).await as i64;

        let guard = self.sessions.lock().await;
        let session = guard
            .get(&session_id)
            .ok_or_else(|| anyhow::anyhow!("simulation session not found"))?;

        let delta_sum = SessionOverlay::new(session).delta_used(provider_id, class);
        Ok((base + delta_sum).max(0) as u64)
    }

    /// The provider a consumer would be placed on if this session's
    /// overlay were committed: the last recorded `move` target, or the
    /// consumer's current live provider for that class if no move was
    /// recorded.
    pub async fn effective_placement(&self, session_id: SessionId, consumer_id: EntityId) -> anyhow::Result<Option<EntityId>> {
        let guard = self.sessions.lock().await;
        let session = guard
            .get(&session_id)
            .ok_or_else(|| anyhow::anyhow!("simulation session not found"))?;

        if let Some(p) = session.effective_source(consumer_id) {
            return Ok(Some(p));
        }
        drop(guard);

        let live = self.graph.read(move |s| {
            s.allocations_of_consumer(consumer_id).first().map(|a| a.resource_provider_id)
        }).await;
        Ok(live)
    }

    /// Utilization statistics (mean/stdev/min/max) of virtual usage
    /// across `classes` for one provider within this session's overlay.
    pub async fn metrics(
        &self,
        session_id: SessionId,
        provider_id: EntityId,
        classes: &[ResourceClass],
    ) -> anyhow::Result<Option<UtilizationStats>> {
        let mut ratios = Vec::with_capacity(classes.len());
        for class in classes {
            let used = self.virtual_usage(session_id, provider_id, class).await?;
            let capacity = self
                .graph
                .read(move |s| s.inventory(provider_id, class).map(|i| i.effective_capacity()))
                .await;
            if let Some(cap) = capacity {
                if cap > 0 {
                    ratios.push(used as f64 / cap as f64);
                }
            }
        }
        Ok(compute_stats(&ratios))
    }

    /// Utilization statistics computed from live state only, ignoring any
    /// session overlay.
    pub async fn live_metrics(&self, provider_id: EntityId, classes: &[ResourceClass]) -> Option<UtilizationStats> {
        let mut ratios = Vec::with_capacity(classes.len());
        for class in classes {
            let used = self.graph.read(|s| s.used(provider_id, class)).await;
            let capacity = self.graph.read(|s| s.inventory(provider_id, class).map(|i| i.effective_capacity())).await;
            if let Some(cap) = capacity {
                if cap > 0 {
                    ratios.push(used as f64 / cap as f64);
                }
            }
        }
        compute_stats(&ratios)
    }

    /// Diffs `session_id`'s metrics against either another session's
    /// metrics or, when `other_session_id` is `None`, against live state.
    /// `None` if either side has no samples to report.
    pub async fn metrics_diff(
        &self,
        session_id: SessionId,
        other_session_id: Option<SessionId>,
        provider_id: EntityId,
        classes: &[ResourceClass],
    ) -> anyhow::Result<Option<UtilizationStatsDiff>> {
        let left = self.metrics(session_id, provider_id, classes).await?;
        let right = match other_session_id {
            Some(other) => self.metrics(other, provider_id, classes).await?,
            None => self.live_metrics(provider_id, classes).await,
        };
        Ok(match (left, right) {
            (Some(l), Some(r)) => Some(diff_stats(&l, &r)),
            _ => None,
        })
    }

    /// Applies every delta in the session's log to the live graph in one
    /// transaction, then marks the session `Committed` and drops it from
    /// the live set. On any failure the session is left untouched and
    /// `Active` — it is still eligible for retry or rollback; a failed
    /// commit must never silently finalize.
    pub async fn commit(&self, session_id: SessionId) -> TachyonResult<()> {
        let snapshot = {
            let guard = self.sessions.lock().await;
            guard
                .get(&session_id)
                .cloned()
                .ok_or_else(|| TachyonError::not_found("SimulationSession", session_id.to_string()))?
        };

        if snapshot.status != SimulationStatus::Active {
            return Err(TachyonError::invalid_state("simulation session is not active"));
        }

        let current_generation = self.graph.global_generation().await;
        if !current_generation.matches(snapshot.base_generation) {
            warn!(
                %session_id,
                expected = snapshot.base_generation.0,
                found = current_generation.0,
                "simulation commit rejected on stale base generation"
            );
            return Err(TachyonError::ConflictGeneration {
                kind: "Graph",
                id: session_id.to_string(),
                expected: snapshot.base_generation.0,
                found: current_generation.0,
            });
        }

        let now = self.clock.now_ms();
        let deltas = snapshot.deltas.clone();
        let deltas_len = deltas.len();
        self.graph
            .run_transaction(move |w| {
                for delta in &deltas {
                    apply_delta(w, delta, now)?;
                }
                Ok(())
            })
            .await?;

        let mut guard = self.sessions.lock().await;
        if let Some(session) = guard.get_mut(&session_id) {
            session.status = SimulationStatus::Committed;
        }
        drop(guard);

        self.store.delete(session_id).await.map_err(|e| TachyonError::Fatal { detail: e.to_string() })?;
        self.sessions.lock().await.remove(&session_id);
        info!(%session_id, deltas = deltas_len, "simulation session committed");
        Ok(())
    }

    /// Discards a session's overlay without touching the live graph.
    pub async fn rollback(&self, session_id: SessionId) -> anyhow::Result<()> {
        let mut guard = self.sessions.lock().await;
        let session = guard
            .get_mut(&session_id)
            .ok_or_else(|| anyhow::anyhow!("simulation session not found"))?;
        session.status = SimulationStatus::RolledBack;
        drop(guard);

        self.store.delete(session_id).await?;
        self.sessions.lock().await.remove(&session_id);
        info!(%session_id, "simulation session rolled back");
        Ok(())
    }

    /// Marks any session past its TTL as `Expired` and drops it, mirroring
    /// the bot's own `expire_sessions` sweep.
    pub async fn sweep(&self, now_ms: u64) {
        let mut guard = self.sessions.lock().await;
        let expired: Vec<SessionId> = guard
            .values()
            .filter(|s| s.status == SimulationStatus::Active && s.is_expired(now_ms))
            .map(|s| s.id)
            .collect();
        drop(guard);

        if !expired.is_empty() {
            info!(count = expired.len(), "sweeping expired simulation sessions");
        }

        for id in expired {
            let _ = self.store.delete(id).await;
            self.sessions.lock().await.remove(&id);
        }
    }

    pub async fn get_session(&self, id: SessionId) -> Option<SimulationSession> {
        self.sessions.lock().await.get(&id).cloned()
    }
}

/// Applies one delta to the live graph, folding it against whatever
/// allocation already exists for that (consumer, provider, class) edge
/// rather than overwriting it outright.
fn apply_delta(w: &mut graph::store::GraphWriter, delta: &SpeculativeDelta, now_ms: u64) -> TachyonResult<()> {
    let consumer_id = delta.consumer_id;
    match &delta.kind {
        DeltaKind::Allocate { provider, resources } => {
            for (class, amount) in resources {
                let existing = w.read().allocations_of_consumer(consumer_id)
                    .iter()
                    .find(|a| a.resource_provider_id == *provider && &a.resource_class == class)
                    .map(|a| a.used)
                    .unwrap_or(0);
                w.record_allocation(Allocation {
                    consumer_id,
                    resource_provider_id: *provider,
                    resource_class: class.clone(),
                    used: existing + amount,
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                })?;
            }
        }
        DeltaKind::Deallocate { provider, resources } => {
            for (class, amount) in resources {
                let existing = w.read().allocations_of_consumer(consumer_id)
                    .iter()
                    .find(|a| a.resource_provider_id == *provider && &a.resource_class == class)
                    .map(|a| a.used)
                    .unwrap_or(0);
                let remaining = existing.saturating_sub(*amount);
                if remaining == 0 {
                    w.remove_allocation(consumer_id, *provider, class)?;
                } else {
                    w.record_allocation(Allocation {
                        consumer_id,
                        resource_provider_id: *provider,
                        resource_class: class.clone(),
                        used: remaining,
                        created_at_ms: now_ms,
                        updated_at_ms: now_ms,
                    })?;
                }
            }
        }
        DeltaKind::Move { from_provider, to_provider, resources } => {
            for (class, amount) in resources {
                let from_existing = w.read().allocations_of_consumer(consumer_id)
                    .iter()
                    .find(|a| a.resource_provider_id == *from_provider && &a.resource_class == class)
                    .map(|a| a.used)
                    .unwrap_or(0);
                let from_remaining = from_existing.saturating_sub(*amount);
                if from_remaining == 0 {
                    w.remove_allocation(consumer_id, *from_provider, class)?;
                } else {
                    w.record_allocation(Allocation {
                        consumer_id,
                        resource_provider_id: *from_provider,
                        resource_class: class.clone(),
                        used: from_remaining,
                        created_at_ms: now_ms,
                        updated_at_ms: now_ms,
                    })?;
                }

                let to_existing = w.read().allocations_of_consumer(consumer_id)
                    .iter()
                    .find(|a| a.resource_provider_id == *to_provider && &a.resource_class == class)
                    .map(|a| a.used)
                    .unwrap_or(0);
                w.record_allocation(Allocation {
                    consumer_id,
                    resource_provider_id: *to_provider,
                    resource_class: class.clone(),
                    used: to_existing + amount,
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                })?;
            }
        }
    }
    Ok(())
}
