//! Database configuration.
//!
//! Defaults follow the shipped tuning; every knob can be overridden via
//! the environment (`THEMIS_*`) before open.

use crate::audit::GovernancePolicy;
use crate::index::fulltext::Bm25Params;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Executor-side limits and hybrid-pipeline tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Whitelist size beyond which filtered vector search switches to
    /// the post-filter path
    pub max_filter_scan_size: usize,
    /// Post-filter over-fetch growth factor (α)
    pub whitelist_growth_factor: f32,
    /// Post-filter retry budget
    pub whitelist_max_attempts: usize,
    /// Cap on eagerly collected candidates for score-ordered sources
    pub max_candidates: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_filter_scan_size: 100_000,
            whitelist_growth_factor: 2.0,
            whitelist_max_attempts: 4,
            max_candidates: 100_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub bm25: Bm25Params,
    pub limits: QueryLimits,
    /// Vector intent queue bound; beyond it writes fail with IndexBacklog
    pub vector_max_backlog: u64,
    /// Interval of the HNSW intent applier
    pub vector_apply_interval_ms: u64,
    /// Interval of HNSW snapshot persistence
    pub vector_snapshot_interval_secs: u64,
    /// Entity cache capacity (entries)
    pub cache_capacity: usize,
    /// Cursor snapshot retention window
    pub cursor_retention_secs: u64,
    /// Default per-operation deadline
    pub default_timeout_ms: u64,
    /// This node's shard id in the topology
    pub local_shard_id: String,
    /// Replica count consulted on resolve
    pub replica_count: usize,
    /// Roles allowed to reveal PII mappings
    pub pii_reveal_roles: Vec<String>,
    #[serde(skip)]
    pub policy: GovernancePolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./themis-data"),
            bm25: Bm25Params::default(),
            limits: QueryLimits::default(),
            vector_max_backlog: 100_000,
            vector_apply_interval_ms: 100,
            vector_snapshot_interval_secs: 300,
            cache_capacity: 65_536,
            cursor_retention_secs: 600,
            default_timeout_ms: 30_000,
            local_shard_id: "shard-0".to_string(),
            replica_count: 0,
            pii_reveal_roles: vec!["pii-officer".to_string()],
            policy: GovernancePolicy::default(),
        }
    }
}

impl DatabaseConfig {
    /// Config rooted at a path, otherwise defaults.
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Apply `THEMIS_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("THEMIS_DB_PATH") {
            config.path = PathBuf::from(path);
        }
        if let Ok(shard) = std::env::var("THEMIS_SHARD_ID") {
            config.local_shard_id = shard;
        }
        if let Ok(timeout) = std::env::var("THEMIS_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                config.default_timeout_ms = ms;
            }
        }
        if let Ok(backlog) = std::env::var("THEMIS_VECTOR_BACKLOG") {
            if let Ok(n) = backlog.parse() {
                config.vector_max_backlog = n;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec_tuning() {
        let config = DatabaseConfig::default();
        assert_eq!(config.limits.max_filter_scan_size, 100_000);
        assert_eq!(config.limits.whitelist_max_attempts, 4);
        assert!((config.limits.whitelist_growth_factor - 2.0).abs() < f32::EPSILON);
        assert!((config.bm25.k1 - 1.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_at_path() {
        let config = DatabaseConfig::at_path("/tmp/x");
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
    }
}
