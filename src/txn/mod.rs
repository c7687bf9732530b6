//! Transaction manager.
//!
//! Snapshot-isolated multi-key transactions over the pessimistic
//! `TransactionDB`. A write to an entity stages, in one atomic batch:
//! the entity blob, deletes of index entries derived from the pre-image,
//! puts of entries derived from the post-image, graph adjacency deltas,
//! the recomputed geo sidecar, a vector intent record, PII map entries
//! and a sealed audit event. Either all land or none do.
//!
//! The HNSW itself is *not* mutated here — only its intent record is,
//! which is what bounds vector staleness without breaking atomicity for
//! everything else.

use crate::audit::{AuditCategory, AuditEvent, AuditSealer, GovernancePolicy, PiiDetector};
use crate::codec;
use crate::index::fulltext;
use crate::index::secondary;
use crate::index::spatial;
use crate::index::timeseries::{self, TsPoint};
use crate::index::vector::{VectorIndexRegistry, VectorIntent};
use crate::storage::db::Db;
use crate::storage::keys::{audit_key, descriptor_key, entity_key};
use crate::storage::{
    CollectionDescriptor, DescriptorCache, Storage, VectorConfig, CF_AUDIT, CF_ENTITY, CF_GRAPH,
    CF_IDX_EQ, CF_IDX_FT, CF_IDX_RANGE, CF_IDX_SPATIAL, CF_META, CF_PII_MAP, CF_TS, CF_VECTOR_WAL,
};
use crate::types::{fields, Entity, FieldValue, Result, ThemisError, Urn};
use rocksdb::Transaction;
use std::sync::Arc;
use tracing::instrument;

/// Outcome of a committed put.
#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub version: u64,
}

/// Coordinates entity mutations with all their index projections.
pub struct TransactionManager {
    storage: Storage,
    descriptors: Arc<DescriptorCache>,
    vectors: Arc<VectorIndexRegistry>,
    sealer: Arc<AuditSealer>,
    policy: Arc<GovernancePolicy>,
    pii: Arc<PiiDetector>,
}

impl TransactionManager {
    pub fn new(
        storage: Storage,
        descriptors: Arc<DescriptorCache>,
        vectors: Arc<VectorIndexRegistry>,
        sealer: Arc<AuditSealer>,
        policy: Arc<GovernancePolicy>,
        pii: Arc<PiiDetector>,
    ) -> Self {
        Self { storage, descriptors, vectors, sealer, policy, pii }
    }

    /// Write an entity at its URN.
    ///
    /// Always bumps the version, including for a byte-identical blob —
    /// audit determinism over write elision.
    #[instrument(skip(self, entity), fields(urn = %urn))]
    pub fn put(&self, urn: &Urn, mut entity: Entity, actor: &str) -> Result<PutOutcome> {
        let mut desc = self.descriptors.load(&urn.collection)?;
        let desc_before = DescriptorCache::serialize(&desc)?;

        // PII anonymization on the post-image, per classification policy.
        let mut pii_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        if self.policy.pii_auto_anonymize(desc.classification) {
            self.anonymize_entity(&mut entity, &mut pii_entries);
        }

        let txn = self.storage.begin();
        let result = self.put_inner(&txn, urn, entity, actor, &mut desc, pii_entries);
        match result {
            Ok(outcome) => {
                txn.commit().map_err(|e| map_commit_error(e, urn))?;
                let desc_after = DescriptorCache::serialize(&desc)?;
                if desc_after != desc_before {
                    self.descriptors.install(&urn.collection, desc);
                }
                Ok(outcome)
            }
            Err(err) => {
                // Rollback discards staged mutations and releases locks.
                let _ = txn.rollback();
                self.descriptors.evict(&urn.collection);
                Err(err)
            }
        }
    }

    fn put_inner(
        &self,
        txn: &Transaction<'_, Db>,
        urn: &Urn,
        mut entity: Entity,
        actor: &str,
        desc: &mut CollectionDescriptor,
        pii_entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<PutOutcome> {
        let cf_entity = self.storage.cf(CF_ENTITY)?;
        let key = entity_key(&urn.collection, urn.uuid);

        // Exclusive lock on the primary key; a concurrent writer aborts
        // with Conflict instead of silently interleaving.
        let pre_blob = txn
            .get_for_update_cf(&cf_entity, &key, true)
            .map_err(|e| map_lock_error(e, urn))?;
        let pre = match &pre_blob {
            Some(blob) => Some(codec::decode(blob, &desc.fields)?),
            None => None,
        };

        // Version chain and timestamps.
        entity.version = pre.as_ref().map(|p| p.version + 1).unwrap_or(1);
        if let Some(pre) = &pre {
            entity.created_at = pre.created_at;
        }
        entity.updated_at = chrono::Utc::now().timestamp_millis();
        entity.refresh_geo_sidecar();

        // URN scope observed at first write, kept for result formatting.
        if desc.urn_model.is_none() {
            desc.urn_model = Some(urn.model);
            desc.urn_namespace = Some(urn.namespace.clone());
        }

        // Vector config: first embedding observation fixes the dimension.
        if let Some(embedding) = entity.embedding() {
            match &desc.vector {
                None => desc.vector = Some(VectorConfig::with_dim(embedding.len())),
                Some(config) if config.dim != embedding.len() => {
                    return Err(ThemisError::DimensionMismatch {
                        expected: config.dim,
                        actual: embedding.len(),
                    })
                }
                _ => {}
            }
        }

        let post_blob = codec::encode(&entity, &mut desc.fields)?;
        txn.put_cf(&cf_entity, &key, &post_blob)?;

        self.stage_index_deltas(txn, urn, desc, pre.as_ref(), Some(&entity))?;
        self.stage_timeseries(txn, urn, &entity)?;
        self.stage_vector_intent(txn, urn, desc, pre.as_ref(), Some(&entity))?;

        for (k, v) in &pii_entries {
            let cf = self.storage.cf(CF_PII_MAP)?;
            txn.put_cf(&cf, k, v)?;
        }

        self.stage_audit(txn, urn, desc, actor, AuditCategory::Write, "put", None)?;

        // Descriptor rides in the same batch; field-id assignment and the
        // write must land together or not at all.
        let cf_meta = self.storage.cf(CF_META)?;
        txn.put_cf(
            &cf_meta,
            &descriptor_key(&urn.collection),
            &DescriptorCache::serialize(desc)?,
        )?;

        Ok(PutOutcome { version: entity.version })
    }

    /// Erase an entity and every index projection derived from it.
    #[instrument(skip(self), fields(urn = %urn))]
    pub fn delete(&self, urn: &Urn, actor: &str) -> Result<()> {
        let mut desc = self.descriptors.load(&urn.collection)?;
        let txn = self.storage.begin();
        let result = self.delete_inner(&txn, urn, actor, &mut desc);
        match result {
            Ok(()) => txn.commit().map_err(|e| map_commit_error(e, urn)),
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    fn delete_inner(
        &self,
        txn: &Transaction<'_, Db>,
        urn: &Urn,
        actor: &str,
        desc: &mut CollectionDescriptor,
    ) -> Result<()> {
        let cf_entity = self.storage.cf(CF_ENTITY)?;
        let key = entity_key(&urn.collection, urn.uuid);
        let pre_blob = txn
            .get_for_update_cf(&cf_entity, &key, true)
            .map_err(|e| map_lock_error(e, urn))?;
        let Some(pre_blob) = pre_blob else {
            // Deleting the absent is a no-op, but still audited.
            self.stage_audit(txn, urn, desc, actor, AuditCategory::Delete, "delete", None)?;
            return Ok(());
        };
        let pre = codec::decode(&pre_blob, &desc.fields)?;

        txn.delete_cf(&cf_entity, &key)?;
        self.stage_index_deltas(txn, urn, desc, Some(&pre), None)?;
        self.stage_vector_intent(txn, urn, desc, Some(&pre), None)?;
        self.stage_audit(txn, urn, desc, actor, AuditCategory::Delete, "delete", None)?;
        Ok(())
    }

    /// Stage eq/range, full-text, spatial and graph deltas. Deletes are
    /// staged before puts so same-key rewrite resolves to the put.
    fn stage_index_deltas(
        &self,
        txn: &Transaction<'_, Db>,
        urn: &Urn,
        desc: &CollectionDescriptor,
        pre: Option<&Entity>,
        post: Option<&Entity>,
    ) -> Result<()> {
        let sec = secondary::compute_delta(&urn.collection, desc, urn.uuid, pre, post);
        let cf_eq = self.storage.cf(CF_IDX_EQ)?;
        let cf_range = self.storage.cf(CF_IDX_RANGE)?;
        for k in &sec.eq_deletes {
            txn.delete_cf(&cf_eq, k)?;
        }
        for k in &sec.eq_puts {
            txn.put_cf(&cf_eq, k, b"")?;
        }
        for k in &sec.range_deletes {
            txn.delete_cf(&cf_range, k)?;
        }
        for k in &sec.range_puts {
            txn.put_cf(&cf_range, k, b"")?;
        }

        let cf_ft = self.storage.cf(CF_IDX_FT)?;
        for field in &desc.fulltext_fields {
            let pre_text = pre.and_then(|e| e.get(field)).and_then(|v| v.as_text());
            let post_text = post.and_then(|e| e.get(field)).and_then(|v| v.as_text());
            if pre_text == post_text {
                continue;
            }
            let delta =
                fulltext::compute_delta(&urn.collection, field, urn.uuid, pre_text, post_text)?;
            for k in &delta.deletes {
                txn.delete_cf(&cf_ft, k)?;
            }
            for (k, v) in &delta.puts {
                txn.put_cf(&cf_ft, k, v)?;
            }
            if delta.stats_delta != (0, 0) {
                // Locked read-modify-write keeps corpus stats exact under
                // concurrency.
                let stats_key = crate::storage::keys::ft_stats_key(&urn.collection, field);
                let current = txn
                    .get_for_update_cf(&cf_ft, &stats_key, true)
                    .map_err(|e| map_lock_error(e, urn))?;
                let stats = match current {
                    Some(bytes) => bincode::deserialize(&bytes)?,
                    None => fulltext::FtStats::default(),
                };
                let updated = fulltext::apply_stats_delta(stats, delta.stats_delta);
                txn.put_cf(&cf_ft, &stats_key, &bincode::serialize(&updated)?)?;
            }
        }

        let spa = spatial::compute_delta(&urn.collection, desc, urn.uuid, pre, post);
        let cf_spatial = self.storage.cf(CF_IDX_SPATIAL)?;
        for k in &spa.deletes {
            txn.delete_cf(&cf_spatial, k)?;
        }
        for k in &spa.puts {
            txn.put_cf(&cf_spatial, k, b"")?;
        }

        let graph_delta = crate::graph::compute_delta(urn, pre, post)?;
        let cf_graph = self.storage.cf(CF_GRAPH)?;
        for k in &graph_delta.deletes {
            txn.delete_cf(&cf_graph, k)?;
        }
        for (k, v) in &graph_delta.puts {
            txn.put_cf(&cf_graph, k, v)?;
        }
        Ok(())
    }

    /// Stage a time-series point when the entity carries one
    /// (`timestamp` + `series_key` + numeric `value`).
    fn stage_timeseries(&self, txn: &Transaction<'_, Db>, urn: &Urn, entity: &Entity) -> Result<()> {
        let Some(ts) = entity.timestamp() else {
            return Ok(());
        };
        let Some(series) = entity.get("series_key").and_then(|v| v.as_text()) else {
            return Ok(());
        };
        let Some(value) = entity.get("value").and_then(|v| v.as_float()) else {
            return Ok(());
        };
        let cf_ts = self.storage.cf(CF_TS)?;
        let key = timeseries::bucket_key(&urn.collection, series, ts);
        let existing = txn
            .get_for_update_cf(&cf_ts, &key, true)
            .map_err(|e| map_lock_error(e, urn))?;
        let merged = timeseries::merge_point(existing.as_deref(), TsPoint { ts, value })?;
        txn.put_cf(&cf_ts, &key, &merged)?;
        Ok(())
    }

    /// Record the HNSW mutation intent; the background applier drains it.
    fn stage_vector_intent(
        &self,
        txn: &Transaction<'_, Db>,
        urn: &Urn,
        desc: &CollectionDescriptor,
        pre: Option<&Entity>,
        post: Option<&Entity>,
    ) -> Result<()> {
        let Some(config) = &desc.vector else {
            return Ok(());
        };
        let pre_vec = pre.and_then(|e| e.embedding());
        let post_vec = post.and_then(|e| e.embedding());
        if pre_vec == post_vec {
            return Ok(());
        }
        // Make sure the in-memory index exists before intents reference it.
        self.vectors.ensure_index(&urn.collection, config);

        let staged_at = chrono::Utc::now().timestamp_millis();
        let intent = match post_vec {
            Some(vector) => VectorIntent::Upsert {
                collection: urn.collection.clone(),
                field: config.field.clone(),
                uuid: urn.uuid,
                vector: vector.to_vec(),
                staged_at,
            },
            None => VectorIntent::Delete {
                collection: urn.collection.clone(),
                field: config.field.clone(),
                uuid: urn.uuid,
                staged_at,
            },
        };
        let seq = self.vectors.allocate_seq()?;
        let (key, value) = VectorIndexRegistry::encode_intent(seq, &intent)?;
        let cf_wal = self.storage.cf(CF_VECTOR_WAL)?;
        txn.put_cf(&cf_wal, &key, &value)?;
        Ok(())
    }

    fn stage_audit(
        &self,
        txn: &Transaction<'_, Db>,
        urn: &Urn,
        desc: &CollectionDescriptor,
        actor: &str,
        category: AuditCategory,
        action: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let mut event = AuditEvent::new(
            category,
            actor,
            &urn.to_string(),
            action,
            desc.classification,
        );
        event.error = error.map(String::from);
        let double = self.policy.level(desc.classification).double_encrypt;
        let record = self.sealer.seal(&event, double)?;
        let cf_audit = self.storage.cf(CF_AUDIT)?;
        txn.put_cf(
            &cf_audit,
            &audit_key(event.ts, event.id),
            &bincode::serialize(&record)?,
        )?;
        Ok(())
    }

    /// Replace PII in every text field of the post-image, collecting the
    /// token → original mappings for the `pii_map` keyspace.
    fn anonymize_entity(&self, entity: &mut Entity, pii_entries: &mut Vec<(Vec<u8>, Vec<u8>)>) {
        let names: Vec<String> = entity
            .fields
            .iter()
            .filter(|(name, value)| {
                matches!(value, FieldValue::Text(_))
                    && !matches!(
                        name.as_str(),
                        fields::FROM | fields::TO | fields::EDGE_TYPE
                    )
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let Some(FieldValue::Text(text)) = entity.fields.get(&name) else {
                continue;
            };
            let (replaced, replacements) = self.pii.anonymize_field(&name, text);
            if replacements.is_empty() {
                continue;
            }
            for r in &replacements {
                pii_entries.push((
                    r.token.to_string().into_bytes(),
                    r.original.clone().into_bytes(),
                ));
            }
            entity.fields.insert(name, FieldValue::Text(replaced));
        }
    }
}

fn map_lock_error(err: rocksdb::Error, urn: &Urn) -> ThemisError {
    use rocksdb::ErrorKind;
    match err.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
            ThemisError::Conflict { urn: urn.to_string() }
        }
        _ => ThemisError::Storage(err),
    }
}

fn map_commit_error(err: rocksdb::Error, urn: &Urn) -> ThemisError {
    map_lock_error(err, urn)
}
