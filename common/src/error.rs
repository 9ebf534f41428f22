//! Error taxonomy shared by every Tachyon crate.
//!
//! Capacity/constraint failures inside planning are
//! never represented here (the planner just returns fewer candidates); this
//! enum is reserved for malformed input, contract violations, and store
//! failures.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TachyonError {
    #[error("bad request: {detail}")]
    BadRequest { detail: String },

    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("stale generation on {kind} {id}: expected {expected}, found {found}")]
    ConflictGeneration {
        kind: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("uniqueness conflict on {kind}: {detail}")]
    ConflictUniqueness { kind: &'static str, detail: String },

    #[error("out of capacity: {detail}")]
    OutOfCapacity { detail: String },

    #[error("invalid state: {detail}")]
    InvalidState { detail: String },

    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("transient store failure: {detail}")]
    Transient { detail: String },

    #[error("fatal error: {detail}")]
    Fatal { detail: String },
}

pub type Result<T> = std::result::Result<T, TachyonError>;

impl TachyonError {
    /// Whether the *caller* may retry the operation that produced this
    /// error. This classification belongs outside the claim
    /// executor and commit path — it is exposed here as a pure function so
    /// every call site (REST handler, importer, test harness) agrees.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TachyonError::ConflictGeneration { .. } | TachyonError::Transient { .. })
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        TachyonError::BadRequest { detail: detail.into() }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        TachyonError::NotFound { kind, id: id.into() }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        TachyonError::InvalidState { detail: detail.into() }
    }

    pub fn out_of_capacity(detail: impl Into<String>) -> Self {
        TachyonError::OutOfCapacity { detail: detail.into() }
    }
}
