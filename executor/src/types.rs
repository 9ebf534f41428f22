//! Common types and small abstraction traits used by the executor.

use std::collections::HashMap;

use common::{EntityId, Generation};

use graph::model::Allocation;

/// Two parallel generation maps the caller must supply: the generation it
/// last observed for every resource provider the candidate touches, and
/// the generation it last observed for the consumer being modified
/// (`None` for a brand-new consumer). Both are re-verified before any
/// write lands.
#[derive(Debug, Clone, Default)]
pub struct ExpectedGenerations {
    pub providers: HashMap<EntityId, Generation>,
    pub consumer: Option<Generation>,
}

/// What the caller wants committed: a consumer claiming a set of
/// allocations, optionally replacing everything that consumer already
/// held.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub consumer_id: EntityId,
    pub project_id: EntityId,
    pub user_id: EntityId,
    pub consumer_type: String,
    pub allocations: Vec<Allocation>,
    pub replace_prior: bool,
    pub expected: ExpectedGenerations,
}

/// Successful claim result: the new global generation and the per-entity
/// generations after the bump.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub consumer_id: EntityId,
    pub global_generation: Generation,
}
