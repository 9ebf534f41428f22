//! Weigher engine.
//!
//! A `Weigher` trait with one built-in implementation per scoring signal,
//! registered in a `WeigherRegistry` — the generalization of the
//! per-pulse-module-plus-shared-validity pattern
//! (`market::pulse::spread`/`slippage`/`trend`/`depth`, each scoring one
//! signal, combined by the caller). Normalization and multiplier
//! combination live here in the registry, never inside an individual
//! `Weigher` impl, so a plugin cannot defeat determinism.

use std::collections::HashMap;

use common::EntityId;
use graph::model::{ResourceClass, ServerGroupPolicy, StandardResourceClass, TraitConstraintKind};
use graph::store::GraphState;

use crate::types::{AllocationCandidate, AllocationRequest};

/// Read-only context a weigher needs beyond the candidate itself.
pub struct WeigherContext<'a> {
    pub state: &'a GraphState,
    pub request: &'a AllocationRequest,
    /// Consumer used as the NUMA/cell reference for `CrossCell` (e.g. the
    /// anchor consumer of a multi-group request). `None` disables the
    /// signal (raw score 0 for every candidate, normalizes to 0.5).
    pub reference_consumer: Option<EntityId>,
    /// Recent build-failure counters per provider, for `BuildFailure`.
    pub build_failures: HashMap<EntityId, u32>,
    /// Normalized hypervisor version per provider in [0, 1], for
    /// `HypervisorVersion`.
    pub hypervisor_versions: HashMap<EntityId, f64>,
}

pub trait Weigher: Send + Sync {
    fn name(&self) -> &'static str;
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64;
}

fn free_of_class(candidate: &AllocationCandidate, ctx: &WeigherContext, class: &ResourceClass) -> f64 {
    candidate
        .slices
        .iter()
        .filter(|s| &s.resource_class == class)
        .filter_map(|s| {
            ctx.state
                .inventory(s.resource_provider_id, class)
                .map(|inv| inv.effective_capacity().saturating_sub(ctx.state.used(s.resource_provider_id, class)))
        })
        .sum::<u64>() as f64
}

pub struct RamWeigher;
impl Weigher for RamWeigher {
    fn name(&self) -> &'static str {
        "ram"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        free_of_class(candidate, ctx, &ResourceClass::Standard(StandardResourceClass::MemoryMb))
    }
}

pub struct CpuWeigher;
impl Weigher for CpuWeigher {
    fn name(&self) -> &'static str {
        "cpu"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        free_of_class(candidate, ctx, &ResourceClass::Standard(StandardResourceClass::Vcpu))
    }
}

pub struct DiskWeigher;
impl Weigher for DiskWeigher {
    fn name(&self) -> &'static str {
        "disk"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let direct = free_of_class(candidate, ctx, &ResourceClass::Standard(StandardResourceClass::DiskGb));
        let shared: f64 = ctx
            .state
            .shares_into(candidate.root_provider_id)
            .iter()
            .filter(|e| e.classes.contains(&ResourceClass::Standard(StandardResourceClass::DiskGb)))
            .filter_map(|e| {
                ctx.state
                    .inventory(e.source_provider_id, &ResourceClass::Standard(StandardResourceClass::DiskGb))
                    .map(|inv| {
                        inv.effective_capacity()
                            .saturating_sub(ctx.state.used(e.source_provider_id, &inv.resource_class))
                    })
            })
            .sum::<u64>() as f64;
        direct + shared
    }
}

/// Negative-signal weigher: count of consumers in transient states. This
/// crate has no notion of "transient consumer state" of its own (the graph
/// model tracks only allocations, not lifecycle phases outside the
/// session subsystem) — approximated here by the count of consumers
/// holding allocations on the root whose `consumer_type` is `"BUILDING"`,
/// the placeholder a caller uses for an in-flight build.
pub struct IoOpsWeigher;
impl Weigher for IoOpsWeigher {
    fn name(&self) -> &'static str {
        "io_ops"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let count = ctx
            .state
            .allocations
            .values()
            .filter(|a| a.resource_provider_id == candidate.root_provider_id)
            .filter_map(|a| ctx.state.consumer(a.consumer_id))
            .filter(|c| c.consumer_type == "BUILDING")
            .count() as f64;
        -count
    }
}

pub struct PciWeigher;
impl Weigher for PciWeigher {
    fn name(&self) -> &'static str {
        "pci"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let requested_pci = ctx
            .request
            .groups
            .iter()
            .any(|g| g.resources.iter().any(|(c, _)| matches!(c, ResourceClass::Standard(StandardResourceClass::PciDevice))));
        let free_pci = free_of_class(candidate, ctx, &ResourceClass::Standard(StandardResourceClass::PciDevice));
        if requested_pci { free_pci } else { -free_pci }
    }
}

pub struct TraitAffinityWeigher;
impl Weigher for TraitAffinityWeigher {
    fn name(&self) -> &'static str {
        "trait_affinity"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let present = ctx.state.traits_of(candidate.root_provider_id);
        let preferred: f64 = ctx
            .request
            .preferred_traits
            .iter()
            .filter(|r| r.kind == TraitConstraintKind::Preferred && present.contains(&r.trait_ref))
            .map(|r| r.weight)
            .sum();
        let avoided: f64 = ctx
            .request
            .avoided_traits
            .iter()
            .filter(|r| r.kind == TraitConstraintKind::Avoided && present.contains(&r.trait_ref))
            .map(|r| r.weight)
            .sum();
        preferred - avoided
    }
}

pub struct ServerGroupSoftAffinityWeigher;
impl Weigher for ServerGroupSoftAffinityWeigher {
    fn name(&self) -> &'static str {
        "server_group_soft_affinity"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let Some(hint) = &ctx.request.server_group else { return 0.0 };
        let Some(group) = ctx.state.server_group(hint.group_id) else { return 0.0 };
        let count = group
            .members
            .iter()
            .flat_map(|c| ctx.state.allocations_of_consumer(*c))
            .filter(|a| a.resource_provider_id == candidate.root_provider_id)
            .count() as f64;
        match hint.policy {
            ServerGroupPolicy::SoftAffinity => count,
            ServerGroupPolicy::SoftAntiAffinity => -count,
            _ => 0.0,
        }
    }
}

pub struct CrossCellWeigher;
impl Weigher for CrossCellWeigher {
    fn name(&self) -> &'static str {
        "cross_cell"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        let Some(reference) = ctx.reference_consumer else { return 0.5 };
        let same_cell = ctx
            .state
            .allocations_of_consumer(reference)
            .iter()
            .any(|a| a.resource_provider_id == candidate.root_provider_id);
        let raw = if same_cell { 0.0 } else { 1.0 };
        -raw
    }
}

pub struct BuildFailureWeigher;
impl Weigher for BuildFailureWeigher {
    fn name(&self) -> &'static str {
        "build_failure"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        -(*ctx.build_failures.get(&candidate.root_provider_id).unwrap_or(&0) as f64)
    }
}

pub struct HypervisorVersionWeigher;
impl Weigher for HypervisorVersionWeigher {
    fn name(&self) -> &'static str {
        "hypervisor_version"
    }
    fn raw_score(&self, candidate: &AllocationCandidate, ctx: &WeigherContext) -> f64 {
        *ctx.hypervisor_versions.get(&candidate.root_provider_id).unwrap_or(&0.5)
    }
}

/// Min-max normalizes `raw` into [0, 1]; `0.5` when every candidate has the
/// same raw score.
fn normalize(raw: &[f64]) -> Vec<f64> {
    let min = raw.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if raw.is_empty() {
        return Vec::new();
    }
    if (max - min).abs() < f64::EPSILON {
        return vec![0.5; raw.len()];
    }
    raw.iter().map(|v| (v - min) / (max - min)).collect()
}

/// Registry of built-in weighers plus the global and aggregate-scoped
/// multiplier table. Combination (`Σ multiplier × normalized`) is owned
/// here, not by any individual `Weigher`.
pub struct WeigherRegistry {
    weighers: Vec<Box<dyn Weigher>>,
    /// Global per-weigher multiplier, keyed by `Weigher::name()`.
    global_multipliers: HashMap<String, f64>,
    /// Per-aggregate override, keyed by `(aggregate_id, weigher_name)`.
    /// When a candidate belongs to several overriding aggregates, the
    /// minimum (most conservative) multiplier applies.
    aggregate_multipliers: HashMap<(EntityId, String), f64>,
}

impl WeigherRegistry {
    pub fn with_builtins(global_multipliers: HashMap<String, f64>) -> Self {
        Self {
            weighers: vec![
                Box::new(RamWeigher),
                Box::new(CpuWeigher),
                Box::new(DiskWeigher),
                Box::new(IoOpsWeigher),
                Box::new(PciWeigher),
                Box::new(TraitAffinityWeigher),
                Box::new(ServerGroupSoftAffinityWeigher),
                Box::new(CrossCellWeigher),
                Box::new(BuildFailureWeigher),
                Box::new(HypervisorVersionWeigher),
            ],
            global_multipliers,
            aggregate_multipliers: HashMap::new(),
        }
    }

    pub fn set_aggregate_multiplier(&mut self, aggregate_id: EntityId, weigher_name: &str, multiplier: f64) {
        self.aggregate_multipliers.insert((aggregate_id, weigher_name.to_string()), multiplier);
    }

    fn multiplier_for(&self, weigher_name: &str, candidate_aggregates: &[EntityId]) -> f64 {
        let overrides: Vec<f64> = candidate_aggregates
            .iter()
            .filter_map(|agg| self.aggregate_multipliers.get(&(*agg, weigher_name.to_string())))
            .copied()
            .collect();
        if overrides.is_empty() {
            *self.global_multipliers.get(weigher_name).unwrap_or(&1.0)
        } else {
            overrides.into_iter().fold(f64::INFINITY, f64::min)
        }
    }

    /// Scores and reorders `candidates` in place: computes each weigher's
    /// raw score across the whole set, min-max normalizes, combines with
    /// multipliers, then sorts by descending score with descending
    /// `observed_generation` (of the root's slice) as the tie-break,
    /// finally lowest `root_provider_id` lexicographically.
    pub fn score(&self, mut candidates: Vec<AllocationCandidate>, ctx: &WeigherContext) -> Vec<AllocationCandidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let mut combined = vec![0.0_f64; candidates.len()];

        for weigher in &self.weighers {
            let raw: Vec<f64> = candidates.iter().map(|c| weigher.raw_score(c, ctx)).collect();
            let normalized = normalize(&raw);
            for (i, candidate) in candidates.iter().enumerate() {
                let aggs: Vec<EntityId> = ctx.state.aggregates_of(candidate.root_provider_id).into_iter().collect();
                let mult = self.multiplier_for(weigher.name(), &aggs);
                combined[i] += mult * normalized[i];
            }
        }

        for (candidate, score) in candidates.iter_mut().zip(combined.iter()) {
            candidate.score = *score;
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_gen = a.slices.iter().map(|s| s.observed_generation).max().unwrap_or_default();
                    let b_gen = b.slices.iter().map(|s| s.observed_generation).max().unwrap_or_default();
                    b_gen.cmp(&a_gen)
                })
                .then_with(|| a.root_provider_id.cmp(&b.root_provider_id))
        });

        candidates
    }
}
