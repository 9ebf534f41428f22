//! Retry envelope. Retry *policy* lives with the caller of
//! the claim executor (e.g. the REST handler), never inside the executor or
//! commit path itself — this module only classifies errors and holds the
//! budget; it never loops on its own.

use crate::config::TachyonConfig;
use crate::error::TachyonError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &TachyonConfig) -> Self {
        Self {
            max_attempts: cfg.graph_store_retry_max,
            backoff_ms: cfg.graph_store_retry_backoff_ms,
        }
    }

    /// Backoff delay before the given (1-indexed) attempt, linear in the
    /// attempt number — deliberately simple; the store adapter is the
    /// thing that actually knows about contention, not this policy object.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms * attempt as u64)
    }

    /// Whether a caller following this policy should try again.
    pub fn should_retry(&self, attempt: u32, err: &TachyonError) -> bool {
        attempt < self.max_attempts && err.is_retryable()
    }
}
