//! Vector index registry: per-(collection, field) HNSW instances, the
//! intent WAL, the background applier, and snapshot durability.
//!
//! Entity writes never mutate the HNSW directly. The transaction stages
//! an intent record into the `vector_wal` CF — atomically with the entity
//! and every other projection — and the single applier task drains
//! intents into the in-memory graph. Vector reads therefore tolerate a
//! bounded staleness equal to the intent queue depth; everything else is
//! snapshot-consistent.

use crate::index::hnsw::{HnswIndex, HnswParams};
use crate::storage::keys::{decode_vector_wal_key, vector_wal_key, vector_watermark_key};
use crate::storage::{Storage, VectorConfig, CF_META, CF_VECTOR_WAL};
use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// A recorded HNSW mutation pending background apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VectorIntent {
    Upsert {
        collection: String,
        field: String,
        uuid: Uuid,
        vector: Vec<f32>,
        /// Stage timestamp (epoch ms), for the apply-lag gauge
        staged_at: i64,
    },
    Delete {
        collection: String,
        field: String,
        uuid: Uuid,
        staged_at: i64,
    },
}

impl VectorIntent {
    fn staged_at(&self) -> i64 {
        match self {
            Self::Upsert { staged_at, .. } | Self::Delete { staged_at, .. } => *staged_at,
        }
    }
}

type IndexKey = (String, String);

/// Registry of HNSW indexes plus the applier state.
pub struct VectorIndexRegistry {
    storage: Storage,
    indexes: RwLock<HashMap<IndexKey, Arc<RwLock<HnswIndex>>>>,
    /// Next WAL sequence to hand out
    next_seq: AtomicU64,
    /// Highest WAL sequence applied to the in-memory graphs
    applied_seq: AtomicU64,
    /// Queue bound; beyond it writes fail with `IndexBacklog`
    max_backlog: u64,
    apply_lag_ms: AtomicU64,
    snapshot_dir: PathBuf,
}

impl VectorIndexRegistry {
    /// Create the registry and recover state: load snapshots, then replay
    /// WAL intents beyond the persisted watermark.
    pub fn open(storage: Storage, max_backlog: u64) -> Result<Self> {
        let snapshot_dir = storage.path().join("vector_snapshots");
        std::fs::create_dir_all(&snapshot_dir)?;

        let applied = match storage.get(CF_META, &vector_watermark_key())? {
            Some(bytes) => bytes
                .try_into()
                .map(u64::from_le_bytes)
                .map_err(|_| ThemisError::IndexCorrupt("bad vector watermark".into()))?,
            None => 0,
        };

        let registry = Self {
            storage,
            indexes: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(applied + 1),
            applied_seq: AtomicU64::new(applied),
            max_backlog,
            apply_lag_ms: AtomicU64::new(0),
            snapshot_dir,
        };

        registry.load_snapshots()?;
        let replayed = registry.apply_pending()?;
        if replayed > 0 {
            debug!(replayed, "replayed vector intents from WAL");
        }

        // Seq counter continues after the highest WAL key present.
        {
            let view = registry.storage.snapshot_view();
            let tail = view.scan_prefix(CF_VECTOR_WAL, b"")?;
            if let Some((key, _)) = tail.last() {
                let max = decode_vector_wal_key(key)?;
                registry.next_seq.store(max + 1, Ordering::SeqCst);
            }
        }

        Ok(registry)
    }

    /// Ensure an index exists for a (collection, field), creating it from
    /// the descriptor's vector config.
    pub fn ensure_index(&self, collection: &str, config: &VectorConfig) -> Arc<RwLock<HnswIndex>> {
        let key = (collection.to_string(), config.field.clone());
        if let Some(index) = self.indexes.read().unwrap().get(&key) {
            return Arc::clone(index);
        }
        let mut map = self.indexes.write().unwrap();
        Arc::clone(map.entry(key).or_insert_with(|| {
            Arc::new(RwLock::new(HnswIndex::new(HnswParams {
                dim: config.dim,
                m: config.m,
                ef_construction: config.ef_construction,
                ef_search: config.ef_search,
                metric: config.metric,
            })))
        }))
    }

    fn index_for(&self, collection: &str, field: &str) -> Option<Arc<RwLock<HnswIndex>>> {
        self.indexes
            .read()
            .unwrap()
            .get(&(collection.to_string(), field.to_string()))
            .cloned()
    }

    /// Allocate a WAL sequence for an intent about to be staged.
    ///
    /// Fails with `IndexBacklog` when the queue bound is exceeded; the
    /// write is rejected before it can widen the staleness window further.
    pub fn allocate_seq(&self) -> Result<u64> {
        let depth = self.queue_depth();
        if depth >= self.max_backlog as usize {
            return Err(ThemisError::IndexBacklog(depth));
        }
        Ok(self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// WAL key + serialized intent for transaction staging.
    pub fn encode_intent(seq: u64, intent: &VectorIntent) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((vector_wal_key(seq), bincode::serialize(intent)?))
    }

    /// Current intent queue depth (`vector_intent_queue_depth` gauge).
    pub fn queue_depth(&self) -> usize {
        let next = self.next_seq.load(Ordering::SeqCst);
        let applied = self.applied_seq.load(Ordering::SeqCst);
        (next.saturating_sub(applied + 1)) as usize
    }

    /// Apply lag of the most recent drain (`vector_apply_lag_ms` gauge).
    pub fn apply_lag_ms(&self) -> u64 {
        self.apply_lag_ms.load(Ordering::SeqCst)
    }

    /// Drain pending intents into the in-memory indexes. Returns the
    /// number applied. Called by the applier task and by recovery.
    pub fn apply_pending(&self) -> Result<usize> {
        let from = self.applied_seq.load(Ordering::SeqCst);
        let view = self.storage.snapshot_view();
        let lower = vector_wal_key(from + 1);
        let upper = vec![0xFF; 9];

        let mut applied = 0usize;
        let mut resume: Option<Vec<u8>> = None;
        let mut high = from;
        loop {
            let batch = view.scan_batch(CF_VECTOR_WAL, &lower, &upper, resume.as_deref(), 256)?;
            if batch.is_empty() {
                break;
            }
            for (key, value) in &batch {
                let seq = decode_vector_wal_key(key)?;
                let intent: VectorIntent = bincode::deserialize(value)?;
                self.apply_one(&intent)?;
                let lag = (chrono::Utc::now().timestamp_millis() - intent.staged_at()).max(0);
                self.apply_lag_ms.store(lag as u64, Ordering::SeqCst);
                high = high.max(seq);
                applied += 1;
            }
            resume = Some(batch.last().unwrap().0.clone());
        }

        if applied > 0 {
            self.applied_seq.store(high, Ordering::SeqCst);
            self.storage
                .put(CF_META, &vector_watermark_key(), &high.to_le_bytes())?;
        }
        Ok(applied)
    }

    fn apply_one(&self, intent: &VectorIntent) -> Result<()> {
        match intent {
            VectorIntent::Upsert { collection, field, uuid, vector, .. } => {
                let index = match self.index_for(collection, field) {
                    Some(index) => index,
                    None => {
                        // First vector observed for this pair; derive
                        // params from the vector itself.
                        let config = VectorConfig {
                            field: field.clone(),
                            ..VectorConfig::with_dim(vector.len())
                        };
                        self.ensure_index(collection, &config)
                    }
                };
                let mut guard = index.write().unwrap();
                if let Err(err) = guard.insert(*uuid, vector.clone()) {
                    // A dimension mismatch here means the write slipped
                    // past admission validation; drop the intent and keep
                    // the applier alive.
                    warn!(%uuid, %err, "skipping unappliable vector intent");
                }
            }
            VectorIntent::Delete { collection, field, uuid, .. } => {
                if let Some(index) = self.index_for(collection, field) {
                    index.write().unwrap().remove(*uuid);
                }
            }
        }
        Ok(())
    }

    /// Search one index. Missing index means no vectors yet: empty result.
    pub fn search(
        &self,
        collection: &str,
        field: &str,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        whitelist: Option<&HashSet<Uuid>>,
    ) -> Result<Vec<(Uuid, f32)>> {
        match self.index_for(collection, field) {
            Some(index) => index.read().unwrap().search(query, k, ef, whitelist),
            None => Ok(Vec::new()),
        }
    }

    /// Expected dimension of an index, if it exists.
    pub fn dimension(&self, collection: &str, field: &str) -> Option<usize> {
        self.index_for(collection, field)
            .map(|i| i.read().unwrap().params().dim)
    }

    /// Persist every index snapshot and truncate the WAL up to the
    /// applied watermark.
    pub fn snapshot_all(&self) -> Result<()> {
        let watermark = self.applied_seq.load(Ordering::SeqCst);
        let map = self.indexes.read().unwrap();
        for ((collection, field), index) in map.iter() {
            let bytes = index.read().unwrap().to_snapshot_bytes()?;
            let path = self.snapshot_path(collection, field);
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)?;
        }
        drop(map);

        // Applied intents are recoverable from the snapshots now.
        let view = self.storage.snapshot_view();
        let entries = view.scan_prefix(CF_VECTOR_WAL, b"")?;
        for (key, _) in entries {
            if decode_vector_wal_key(&key)? <= watermark {
                self.storage.delete(CF_VECTOR_WAL, &key)?;
            }
        }
        Ok(())
    }

    fn snapshot_path(&self, collection: &str, field: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{collection}__{field}.hnsw"))
    }

    fn load_snapshots(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.snapshot_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("hnsw") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let Some((collection, field)) = stem.split_once("__") else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            let index = HnswIndex::from_snapshot_bytes(&bytes)?;
            self.indexes.write().unwrap().insert(
                (collection.to_string(), field.to_string()),
                Arc::new(RwLock::new(index)),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage_upsert(
        storage: &Storage,
        registry: &VectorIndexRegistry,
        uuid: Uuid,
        vector: Vec<f32>,
    ) {
        let seq = registry.allocate_seq().unwrap();
        let intent = VectorIntent::Upsert {
            collection: "docs".into(),
            field: "embedding".into(),
            uuid,
            vector,
            staged_at: chrono::Utc::now().timestamp_millis(),
        };
        let (key, value) = VectorIndexRegistry::encode_intent(seq, &intent).unwrap();
        storage.put(CF_VECTOR_WAL, &key, &value).unwrap();
    }

    #[test]
    fn test_intent_apply_and_search() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = VectorIndexRegistry::open(storage.clone(), 10_000).unwrap();

        let uuid = Uuid::new_v4();
        stage_upsert(&storage, &registry, uuid, vec![1.0, 0.0, 0.0]);
        assert_eq!(registry.queue_depth(), 1);

        assert_eq!(registry.apply_pending().unwrap(), 1);
        assert_eq!(registry.queue_depth(), 0);

        let hits = registry
            .search("docs", "embedding", &[1.0, 0.0, 0.0], 1, None, None)
            .unwrap();
        assert_eq!(hits[0].0, uuid);
    }

    #[test]
    fn test_backlog_bound() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = VectorIndexRegistry::open(storage.clone(), 2).unwrap();

        registry.allocate_seq().unwrap();
        registry.allocate_seq().unwrap();
        assert!(matches!(
            registry.allocate_seq(),
            Err(ThemisError::IndexBacklog(_))
        ));
    }

    #[test]
    fn test_delete_intent_removes_vector() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = VectorIndexRegistry::open(storage.clone(), 10_000).unwrap();

        let uuid = Uuid::new_v4();
        stage_upsert(&storage, &registry, uuid, vec![0.5, 0.5]);
        registry.apply_pending().unwrap();

        let seq = registry.allocate_seq().unwrap();
        let intent = VectorIntent::Delete {
            collection: "docs".into(),
            field: "embedding".into(),
            uuid,
            staged_at: chrono::Utc::now().timestamp_millis(),
        };
        let (key, value) = VectorIndexRegistry::encode_intent(seq, &intent).unwrap();
        storage.put(CF_VECTOR_WAL, &key, &value).unwrap();
        registry.apply_pending().unwrap();

        let hits = registry
            .search("docs", "embedding", &[0.5, 0.5], 5, None, None)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_snapshot_and_recovery() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let uuid_a = Uuid::new_v4();
        let uuid_b = Uuid::new_v4();

        {
            let registry = VectorIndexRegistry::open(storage.clone(), 10_000).unwrap();
            stage_upsert(&storage, &registry, uuid_a, vec![1.0, 0.0]);
            registry.apply_pending().unwrap();
            registry.snapshot_all().unwrap();
            // Staged after the snapshot: must come back via WAL replay.
            stage_upsert(&storage, &registry, uuid_b, vec![0.0, 1.0]);
        }

        let recovered = VectorIndexRegistry::open(storage.clone(), 10_000).unwrap();
        let hits_a = recovered
            .search("docs", "embedding", &[1.0, 0.0], 1, None, None)
            .unwrap();
        assert_eq!(hits_a[0].0, uuid_a);
        let hits_b = recovered
            .search("docs", "embedding", &[0.0, 1.0], 1, None, None)
            .unwrap();
        assert_eq!(hits_b[0].0, uuid_b);
    }
}
