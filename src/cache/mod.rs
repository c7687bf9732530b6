//! Bounded entity cache with TinyLFU admission.
//!
//! Keyed by URN, values are `(blob, version, cached_at)`. A count-min
//! sketch estimates access frequency; on a full cache a new entry is
//! admitted only when its frequency beats the LRU victim's. Puts require
//! `version >= apply_watermark`; a topology epoch bump invalidates the
//! whole cache so stale entries get re-verified on next read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One cached entity blob.
#[derive(Debug, Clone)]
pub struct CachedEntity {
    pub blob: Vec<u8>,
    pub version: u64,
    /// Epoch ms the entry was cached at, for TTL checks
    pub cached_at: i64,
    epoch: u64,
}

/// Four-row count-min sketch with periodic halving (the "aging" that
/// makes it *tiny* LFU).
struct FrequencySketch {
    rows: [Vec<u8>; 4],
    mask: usize,
    additions: usize,
    reset_at: usize,
}

impl FrequencySketch {
    fn new(capacity: usize) -> Self {
        let width = capacity.next_power_of_two().max(64);
        Self {
            rows: std::array::from_fn(|_| vec![0u8; width]),
            mask: width - 1,
            additions: 0,
            reset_at: width * 10,
        }
    }

    fn indexes(&self, key: &[u8]) -> [usize; 4] {
        let h = blake3::hash(key);
        let bytes = h.as_bytes();
        std::array::from_fn(|i| {
            let chunk: [u8; 8] = bytes[i * 8..i * 8 + 8].try_into().unwrap();
            (u64::from_le_bytes(chunk) as usize) & self.mask
        })
    }

    fn increment(&mut self, key: &[u8]) {
        for (row, idx) in self.indexes(key).into_iter().enumerate() {
            let slot = &mut self.rows[row][idx];
            *slot = slot.saturating_add(1);
        }
        self.additions += 1;
        if self.additions >= self.reset_at {
            self.halve();
        }
    }

    fn estimate(&self, key: &[u8]) -> u8 {
        self.indexes(key)
            .into_iter()
            .enumerate()
            .map(|(row, idx)| self.rows[row][idx])
            .min()
            .unwrap_or(0)
    }

    fn halve(&mut self) {
        for row in &mut self.rows {
            for slot in row.iter_mut() {
                *slot /= 2;
            }
        }
        self.additions = 0;
    }
}

struct CacheInner {
    entries: HashMap<String, CachedEntity>,
    /// LRU order: front = oldest. Rough but sufficient for victim choice.
    order: Vec<String>,
    sketch: FrequencySketch,
}

/// The cache itself. Interior mutability keeps call sites simple; the
/// critical section is short.
pub struct EntityCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    epoch: AtomicU64,
    apply_watermark: AtomicU64,
}

impl EntityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                sketch: FrequencySketch::new(capacity),
            }),
            capacity: capacity.max(1),
            epoch: AtomicU64::new(0),
            apply_watermark: AtomicU64::new(0),
        }
    }

    /// Look up a blob, honoring a per-classification TTL (seconds).
    /// Entries from an older topology epoch miss (and are dropped).
    pub fn get(&self, urn: &str, ttl_seconds: u64) -> Option<CachedEntity> {
        let mut inner = self.inner.lock().unwrap();
        inner.sketch.increment(urn.as_bytes());

        let current_epoch = self.epoch.load(Ordering::SeqCst);
        let entry = inner.entries.get(urn)?.clone();
        if entry.epoch != current_epoch {
            inner.entries.remove(urn);
            inner.order.retain(|k| k != urn);
            return None;
        }
        if ttl_seconds == 0 {
            return None;
        }
        let age_ms = chrono::Utc::now().timestamp_millis() - entry.cached_at;
        if age_ms > (ttl_seconds as i64) * 1000 {
            inner.entries.remove(urn);
            inner.order.retain(|k| k != urn);
            return None;
        }
        // Touch for LRU.
        inner.order.retain(|k| k != urn);
        inner.order.push(urn.to_string());
        Some(entry)
    }

    /// Insert a blob. Rejected when `version` is below the apply
    /// watermark (the write that produced it is already superseded).
    pub fn put(&self, urn: &str, blob: Vec<u8>, version: u64) {
        if version < self.apply_watermark.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let epoch = self.epoch.load(Ordering::SeqCst);

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(urn) {
            // TinyLFU admission: newcomer must beat the LRU victim.
            let victim = inner.order.first().cloned();
            if let Some(victim) = victim {
                let new_freq = inner.sketch.estimate(urn.as_bytes());
                let victim_freq = inner.sketch.estimate(victim.as_bytes());
                if new_freq <= victim_freq {
                    return;
                }
                inner.entries.remove(&victim);
                inner.order.retain(|k| k != &victim);
            }
        }

        inner.order.retain(|k| k != urn);
        inner.order.push(urn.to_string());
        inner.entries.insert(
            urn.to_string(),
            CachedEntity {
                blob,
                version,
                cached_at: chrono::Utc::now().timestamp_millis(),
                epoch,
            },
        );
    }

    /// Drop one entry (called after a committed write to the URN).
    pub fn invalidate(&self, urn: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(urn);
        inner.order.retain(|k| k != urn);
    }

    /// Raise the version floor for admission.
    pub fn set_apply_watermark(&self, watermark: u64) {
        self.apply_watermark.store(watermark, Ordering::SeqCst);
    }

    /// Topology changed: every cached entry becomes suspect.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let cache = EntityCache::new(16);
        cache.put("urn:a", b"blob".to_vec(), 1);
        let hit = cache.get("urn:a", 3600).unwrap();
        assert_eq!(hit.blob, b"blob");
        assert_eq!(hit.version, 1);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = EntityCache::new(16);
        cache.put("urn:a", b"blob".to_vec(), 1);
        assert!(cache.get("urn:a", 0).is_none());
    }

    #[test]
    fn test_epoch_bump_invalidates() {
        let cache = EntityCache::new(16);
        cache.put("urn:a", b"blob".to_vec(), 1);
        cache.bump_epoch();
        assert!(cache.get("urn:a", 3600).is_none());
    }

    #[test]
    fn test_watermark_rejects_stale_versions() {
        let cache = EntityCache::new(16);
        cache.set_apply_watermark(5);
        cache.put("urn:a", b"old".to_vec(), 3);
        assert!(cache.get("urn:a", 3600).is_none());
        cache.put("urn:a", b"new".to_vec(), 6);
        assert!(cache.get("urn:a", 3600).is_some());
    }

    #[test]
    fn test_admission_prefers_frequent_keys() {
        let cache = EntityCache::new(2);
        cache.put("hot", b"h".to_vec(), 1);
        cache.put("warm", b"w".to_vec(), 1);
        // Heat up "hot" well past anything else.
        for _ in 0..32 {
            cache.get("hot", 3600);
        }
        // A cold newcomer cannot evict anyone.
        cache.put("cold", b"c".to_vec(), 1);
        assert!(cache.get("hot", 3600).is_some());
        assert!(cache.get("cold", 3600).is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = EntityCache::new(16);
        cache.put("urn:a", b"blob".to_vec(), 1);
        cache.invalidate("urn:a");
        assert!(cache.get("urn:a", 3600).is_none());
    }

    #[test]
    fn test_frequency_sketch_halving() {
        let mut sketch = FrequencySketch::new(64);
        for _ in 0..100 {
            sketch.increment(b"key");
        }
        // Saturates at u8 ceiling but halving keeps estimates bounded.
        assert!(sketch.estimate(b"key") > 0);
        sketch.halve();
        let after = sketch.estimate(b"key");
        assert!(after <= 127);
    }
}
