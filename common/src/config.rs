//! Process configuration, loaded once from the environment.
//!
//! Follows `AppConfig::from_env`'s convention: every key is
//! optional with a sane default, unrecognized env vars are simply not read.
//! See the module-level table below for the authoritative key list.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct TachyonConfig {
    /// Authentication collaborator contract. Opaque to the core — the
    /// adaptor that owns auth interprets this string.
    pub auth_strategy: String,

    /// Graph store connection string.
    pub graph_store_endpoint: String,
    pub graph_store_retry_max: u32,
    pub graph_store_retry_backoff_ms: u64,

    /// Default candidate count when a request omits `limit`.
    pub candidates_default_limit: usize,

    /// Per-weigher global multiplier overrides, keyed by weigher name.
    /// Positive spreads load across candidates, negative stacks it.
    pub weigher_multipliers: HashMap<String, f64>,

    pub simulation_default_ttl: Duration,
    pub simulation_sweep_interval: Duration,

    /// Identifier for the frozen standard-trait/resource-class list this
    /// deployment uses.
    pub standard_traits_source: String,
}

impl TachyonConfig {
    pub fn from_env() -> Self {
        let graph_store_endpoint = std::env::var("TACHYON_GRAPH_STORE_ENDPOINT")
            .unwrap_or_else(|_| "memory://local".to_string());

        let graph_store_retry_max = env_parse("TACHYON_GRAPH_STORE_RETRY_MAX", 3);
        let graph_store_retry_backoff_ms =
            env_parse("TACHYON_GRAPH_STORE_RETRY_BACKOFF_MS", 50);

        let candidates_default_limit = env_parse("TACHYON_CANDIDATES_DEFAULT_LIMIT", 1000);

        let simulation_default_ttl_secs = env_parse("TACHYON_SIMULATION_DEFAULT_TTL_SECS", 900);
        let simulation_sweep_interval_secs =
            env_parse("TACHYON_SIMULATION_SWEEP_INTERVAL_SECS", 60);

        Self {
            auth_strategy: std::env::var("TACHYON_AUTH_STRATEGY")
                .unwrap_or_else(|_| "noauth".to_string()),
            graph_store_endpoint,
            graph_store_retry_max,
            graph_store_retry_backoff_ms,
            candidates_default_limit,
            weigher_multipliers: parse_multiplier_map(),
            simulation_default_ttl: Duration::from_secs(simulation_default_ttl_secs),
            simulation_sweep_interval: Duration::from_secs(simulation_sweep_interval_secs),
            standard_traits_source: std::env::var("TACHYON_STANDARD_TRAITS_SOURCE")
                .unwrap_or_else(|_| "os-traits-1.0".to_string()),
        }
    }

    /// Resolve the effective multiplier for a named weigher, falling back
    /// to `default` when no override is configured.
    pub fn weigher_multiplier(&self, name: &str, default: f64) -> f64 {
        self.weigher_multipliers.get(name).copied().unwrap_or(default)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Reads `TACHYON_WEIGHER_<NAME>_MULTIPLIER` pairs. Because the set of
/// weigher names is open-ended (custom weighers may register later), we
/// scan the environment rather than hardcoding names.
fn parse_multiplier_map() -> HashMap<String, f64> {
    const PREFIX: &str = "TACHYON_WEIGHER_";
    const SUFFIX: &str = "_MULTIPLIER";

    std::env::vars()
        .filter_map(|(k, v)| {
            let name = k.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
            let value: f64 = v.parse().ok()?;
            Some((name.to_lowercase(), value))
        })
        .collect()
}
