//! Consistent-hash ring.
//!
//! ~150 virtual tokens per shard on a 64-bit ring. The token for a URN is
//! the first 8 bytes of `blake3(uuid)`; the primary shard is the
//! successor of that token, replicas the next distinct-shard successors.
//! Adding or removing a shard reassigns only ~1/S of the token space.

use std::collections::BTreeMap;
use uuid::Uuid;

/// Virtual tokens per shard.
pub const VNODES_PER_SHARD: usize = 150;

/// The ring: token → shard id.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    tokens: BTreeMap<u64, String>,
}

/// Token for a URN's uuid.
pub fn urn_token(uuid: Uuid) -> u64 {
    let hash = blake3::hash(uuid.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

fn vnode_token(shard_id: &str, vnode: usize) -> u64 {
    let hash = blake3::hash(format!("shard:{shard_id}:{vnode}").as_bytes());
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the ring from a shard id list.
    pub fn from_shards<'a>(shards: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ring = Self::new();
        for shard in shards {
            ring.add_shard(shard);
        }
        ring
    }

    pub fn add_shard(&mut self, shard_id: &str) {
        for vnode in 0..VNODES_PER_SHARD {
            self.tokens
                .insert(vnode_token(shard_id, vnode), shard_id.to_string());
        }
    }

    pub fn remove_shard(&mut self, shard_id: &str) {
        self.tokens.retain(|_, s| s != shard_id);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Distinct shard count.
    pub fn shard_count(&self) -> usize {
        let mut shards: Vec<&String> = self.tokens.values().collect();
        shards.sort();
        shards.dedup();
        shards.len()
    }

    /// Primary shard for a uuid: successor of its token on the ring.
    pub fn primary(&self, uuid: Uuid) -> Option<&str> {
        self.successor(urn_token(uuid))
    }

    /// Primary plus the next `replica_count` distinct-shard successors.
    pub fn replica_set(&self, uuid: Uuid, replica_count: usize) -> Vec<String> {
        if self.tokens.is_empty() {
            return Vec::new();
        }
        let token = urn_token(uuid);
        let mut out: Vec<String> = Vec::with_capacity(replica_count + 1);
        // Walk the ring from the token, wrapping once.
        for (_, shard) in self.tokens.range(token..).chain(self.tokens.range(..token)) {
            if !out.contains(shard) {
                out.push(shard.clone());
                if out.len() == replica_count + 1 {
                    break;
                }
            }
        }
        out
    }

    fn successor(&self, token: u64) -> Option<&str> {
        self.tokens
            .range(token..)
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(_, s)| s.as_str())
    }
}
