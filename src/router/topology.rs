//! Cluster topology view.
//!
//! The router consumes an external metadata service; topology is cached
//! with an epoch version, and every epoch bump also invalidates the
//! entity cache upstream.

use crate::router::ring::HashRing;
use crate::types::{Result, ThemisError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// One shard as reported by the metadata service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: String,
    pub primary_endpoint: String,
    pub replicas: Vec<String>,
    pub datacenter: String,
    pub rack: String,
    pub token_start: u64,
    pub token_end: u64,
    pub healthy: bool,
    pub cert_serial: String,
}

impl ShardInfo {
    /// Minimal shard record for single-node and test setups.
    pub fn local(id: &str) -> Self {
        Self {
            id: id.to_string(),
            primary_endpoint: "local".to_string(),
            replicas: Vec::new(),
            datacenter: "dc1".to_string(),
            rack: "rack1".to_string(),
            token_start: 0,
            token_end: u64::MAX,
            healthy: true,
            cert_serial: String::new(),
        }
    }
}

/// External cluster-metadata service, consumed at its interface only.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn list_shards(&self) -> Result<Vec<ShardInfo>>;
}

/// Fixed shard list; the single-node deployment and every test use this.
pub struct StaticMetadata {
    shards: Vec<ShardInfo>,
}

impl StaticMetadata {
    pub fn new(shards: Vec<ShardInfo>) -> Self {
        Self { shards }
    }
}

#[async_trait]
impl MetadataService for StaticMetadata {
    async fn list_shards(&self) -> Result<Vec<ShardInfo>> {
        Ok(self.shards.clone())
    }
}

/// Cached topology with an epoch version and the derived hash ring.
pub struct TopologyView {
    epoch: AtomicU64,
    shards: RwLock<Vec<ShardInfo>>,
    ring: RwLock<HashRing>,
}

impl TopologyView {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            shards: RwLock::new(Vec::new()),
            ring: RwLock::new(HashRing::new()),
        }
    }

    /// Install a fresh shard list; bumps the epoch when membership
    /// actually changed.
    pub fn refresh(&self, shards: Vec<ShardInfo>) -> bool {
        let changed = {
            let current = self.shards.read().unwrap();
            current.len() != shards.len()
                || current
                    .iter()
                    .zip(&shards)
                    .any(|(a, b)| a.id != b.id || a.healthy != b.healthy)
        };
        if changed {
            let ring = HashRing::from_shards(shards.iter().map(|s| s.id.as_str()));
            *self.ring.write().unwrap() = ring;
            *self.shards.write().unwrap() = shards;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        changed
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn shards(&self) -> Vec<ShardInfo> {
        self.shards.read().unwrap().clone()
    }

    pub fn shard_by_id(&self, id: &str) -> Option<ShardInfo> {
        self.shards.read().unwrap().iter().find(|s| s.id == id).cloned()
    }

    /// Primary shard and replica set for a URN's uuid.
    pub fn resolve(&self, uuid: Uuid, replica_count: usize) -> Result<(ShardInfo, Vec<ShardInfo>)> {
        let ring = self.ring.read().unwrap();
        let set = ring.replica_set(uuid, replica_count);
        drop(ring);
        let Some(primary_id) = set.first() else {
            return Err(ThemisError::BackendUnavailable("empty topology".into()));
        };
        let shards = self.shards.read().unwrap();
        let lookup = |id: &str| shards.iter().find(|s| s.id == id).cloned();
        let primary = lookup(primary_id)
            .ok_or_else(|| ThemisError::BackendUnavailable(format!("unknown shard {primary_id}")))?;
        let replicas = set[1..].iter().filter_map(|id| lookup(id)).collect();
        Ok((primary, replicas))
    }
}

impl Default for TopologyView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_shards() -> Vec<ShardInfo> {
        (0..3).map(|i| ShardInfo::local(&format!("shard-{i}"))).collect()
    }

    #[test]
    fn test_refresh_bumps_epoch_on_change_only() {
        let view = TopologyView::new();
        assert!(view.refresh(three_shards()));
        let epoch = view.epoch();
        assert!(!view.refresh(three_shards()));
        assert_eq!(view.epoch(), epoch);

        let mut changed = three_shards();
        changed[1].healthy = false;
        assert!(view.refresh(changed));
        assert_eq!(view.epoch(), epoch + 1);
    }

    #[test]
    fn test_resolve_returns_primary_and_replicas() {
        let view = TopologyView::new();
        view.refresh(three_shards());
        let (primary, replicas) = view.resolve(Uuid::new_v4(), 2).unwrap();
        assert!(primary.id.starts_with("shard-"));
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.id != primary.id));
    }

    #[test]
    fn test_empty_topology_is_unavailable() {
        let view = TopologyView::new();
        assert!(matches!(
            view.resolve(Uuid::new_v4(), 1),
            Err(ThemisError::BackendUnavailable(_))
        ));
    }
}
