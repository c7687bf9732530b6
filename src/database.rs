//! High-level database facade.
//!
//! Owns the storage engine, every index registry, the transaction
//! manager, the audit sealer, the entity cache and the background
//! workers, and exposes the operation API the admission layer adapts to
//! HTTP: get / put / delete / batchGet / query / vectorSearch /
//! graphTraverse.
//!
//! Startup order: open engine → recover vector WAL → load HNSW
//! snapshots → replay intents → warm cache → publish topology → accept
//! traffic. Teardown runs in reverse behind a drain flag that refuses
//! new work.

use crate::audit::{
    AuditCategory, AuditEvent, AuditSealer, GovernancePolicy, LekSchedule, PiiDetector,
    SealedAuditRecord,
};
use crate::cache::EntityCache;
use crate::codec;
use crate::config::DatabaseConfig;
use crate::graph::{Traverser, TraversalConstraints, TraversalPath};
use crate::index::timeseries;
use crate::index::vector::VectorIndexRegistry;
use crate::query::cursor::{Cursor, SnapshotRegistry};
use crate::query::executor::{Executor, ResultRow};
use crate::query::plan::{Predicate, QueryPlan, VectorClause};
use crate::router::{ShardRequest, ShardResponse, ShardRow};
use crate::storage::keys::{audit_key, entity_key};
use crate::storage::{DescriptorCache, Storage, CF_AUDIT, CF_ENTITY, CF_PII_MAP, CF_TS};
use crate::telemetry::{db_span, DbOperation, Metrics};
use crate::txn::TransactionManager;
use crate::types::{Entity, Result, ThemisError, Urn};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Output of a query operation.
#[derive(Debug)]
pub struct QueryOutput {
    pub rows: Vec<ResultRow>,
    /// Opaque continuation; present when the limit was reached
    pub cursor: Option<Vec<u8>>,
    /// Shards that failed, best-effort scatter only
    pub failing_shards: Vec<String>,
}

/// The database instance. One per process: one engine, one HNSW set,
/// one entity cache, one signing key, one current LEK.
pub struct Database {
    config: DatabaseConfig,
    storage: Storage,
    descriptors: Arc<DescriptorCache>,
    vectors: Arc<VectorIndexRegistry>,
    txn: TransactionManager,
    sealer: Arc<AuditSealer>,
    policy: Arc<GovernancePolicy>,
    cache: Arc<EntityCache>,
    snapshots: Arc<SnapshotRegistry>,
    pub metrics: Arc<Metrics>,
    state: AtomicU8,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Database {
    /// Open the database with generated key material (single-node
    /// development shape). Production injects keys via `open_with_keys`.
    pub fn open(config: DatabaseConfig) -> Result<Arc<Self>> {
        let master = {
            let mut key = [0u8; 32];
            use rand::RngCore;
            OsRng.fill_bytes(&mut key);
            key
        };
        Self::open_with_keys(config, master, SigningKey::generate(&mut OsRng))
    }

    /// Open with explicit audit master key and node signing key.
    pub fn open_with_keys(
        config: DatabaseConfig,
        audit_master_key: [u8; 32],
        signing_key: SigningKey,
    ) -> Result<Arc<Self>> {
        let storage = Storage::open(&config.path)?;
        let descriptors = Arc::new(DescriptorCache::new(storage.clone()));
        // Recovers: loads HNSW snapshots, replays intents past watermark.
        let vectors = Arc::new(VectorIndexRegistry::open(
            storage.clone(),
            config.vector_max_backlog,
        )?);
        let sealer = Arc::new(AuditSealer::new(
            LekSchedule::new(audit_master_key),
            signing_key,
        ));
        let policy = Arc::new(config.policy.clone());
        let pii = Arc::new(PiiDetector::default());
        let txn = TransactionManager::new(
            storage.clone(),
            Arc::clone(&descriptors),
            Arc::clone(&vectors),
            Arc::clone(&sealer),
            Arc::clone(&policy),
            pii,
        );

        let db = Arc::new(Self {
            cache: Arc::new(EntityCache::new(config.cache_capacity)),
            snapshots: Arc::new(SnapshotRegistry::new(Duration::from_secs(
                config.cursor_retention_secs,
            ))),
            metrics: Arc::new(Metrics::default()),
            state: AtomicU8::new(STATE_RUNNING),
            workers: Mutex::new(Vec::new()),
            config,
            storage,
            descriptors,
            vectors,
            txn,
            sealer,
            policy,
        });
        info!(path = %db.config.path.display(), "database open");
        Ok(db)
    }

    /// Spawn the background workers (HNSW intent applier, periodic
    /// snapshots). Requires a tokio runtime.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();

        let applier = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                applier.config.vector_apply_interval_ms,
            ));
            loop {
                interval.tick().await;
                if applier.state.load(Ordering::SeqCst) == STATE_CLOSED {
                    break;
                }
                if let Err(err) = applier.vectors.apply_pending() {
                    tracing::error!(%err, "vector intent apply failed");
                }
                applier.metrics.record_vector_state(
                    applier.vectors.queue_depth(),
                    applier.vectors.apply_lag_ms(),
                );
            }
        }));

        let snapshotter = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                snapshotter.config.vector_snapshot_interval_secs,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                if snapshotter.state.load(Ordering::SeqCst) == STATE_CLOSED {
                    break;
                }
                if let Err(err) = snapshotter.vectors.snapshot_all() {
                    tracing::error!(%err, "vector snapshot failed");
                }
            }
        }));
    }

    fn check_running(&self) -> Result<()> {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => Ok(()),
            _ => Err(ThemisError::Overloaded("draining".into())),
        }
    }

    fn deadline(&self, timeout_ms: Option<u64>) -> Instant {
        Instant::now() + Duration::from_millis(timeout_ms.unwrap_or(self.config.default_timeout_ms))
    }

    // --- canonical operations ---

    /// URN-keyed point read. `Ok(None)` is NotFound at the interface.
    pub fn get(&self, urn: &Urn, actor: &str) -> Result<Option<serde_json::Value>> {
        self.check_running()?;
        let _span = db_span(DbOperation::Get, Some(&urn.collection), Some(&urn.namespace))
            .entered();
        let desc = self.descriptors.load(&urn.collection)?;
        let ttl = self.policy.cache_ttl_seconds(desc.classification);

        let urn_str = urn.to_string();
        let blob = match self.cache.get(&urn_str, ttl) {
            Some(cached) => Some(cached.blob),
            None => {
                let blob = self
                    .storage
                    .get(CF_ENTITY, &entity_key(&urn.collection, urn.uuid))?;
                if let Some(blob) = &blob {
                    let (version, _, _) = codec::decode_header(blob)?;
                    self.cache.put(&urn_str, blob.clone(), version);
                }
                blob
            }
        };
        self.audit_read(urn, actor, "get")?;
        match blob {
            Some(blob) => {
                let entity = codec::decode(&blob, &desc.fields)?;
                Ok(Some(entity.to_json()))
            }
            None => Ok(None),
        }
    }

    /// URN-keyed write. Returns the committed version.
    pub fn put(&self, urn: &Urn, body: &serde_json::Value, actor: &str) -> Result<u64> {
        self.check_running()?;
        let _span = db_span(DbOperation::Put, Some(&urn.collection), Some(&urn.namespace))
            .entered();
        let entity = Entity::from_json(body)?;
        let outcome = self.txn.put(urn, entity, actor)?;
        self.cache.invalidate(&urn.to_string());
        self.metrics.entities_written.fetch_add(1, Ordering::Relaxed);
        Ok(outcome.version)
    }

    /// URN-keyed erase: entity plus every index projection.
    pub fn delete(&self, urn: &Urn, actor: &str) -> Result<()> {
        self.check_running()?;
        let _span = db_span(DbOperation::Delete, Some(&urn.collection), Some(&urn.namespace))
            .entered();
        self.txn.delete(urn, actor)?;
        self.cache.invalidate(&urn.to_string());
        Ok(())
    }

    /// Ordered multi-get under one snapshot. Partial results are not
    /// allowed: any backend error aborts the whole call.
    pub fn batch_get(&self, urns: &[Urn], actor: &str) -> Result<Vec<Option<serde_json::Value>>> {
        self.check_running()?;
        let _span = db_span(DbOperation::BatchGet, None, None).entered();
        let view = self.storage.snapshot_view();
        let mut out = Vec::with_capacity(urns.len());
        for urn in urns {
            let desc = self.descriptors.load(&urn.collection)?;
            let blob = view.get(CF_ENTITY, &entity_key(&urn.collection, urn.uuid))?;
            out.push(match blob {
                Some(blob) => Some(codec::decode(&blob, &desc.fields)?.to_json()),
                None => None,
            });
            self.audit_read(urn, actor, "batch_get")?;
        }
        Ok(out)
    }

    /// Execute a query plan against one snapshot.
    pub fn query(
        &self,
        plan: &QueryPlan,
        timeout_ms: Option<u64>,
        cursor: Option<&[u8]>,
    ) -> Result<QueryOutput> {
        self.check_running()?;
        let _span = db_span(DbOperation::Query, Some(&plan.collection), plan.namespace.as_deref())
            .entered();
        self.gate_plan(plan)?;

        let mut effective = plan.clone();
        let snapshot_id = match cursor {
            Some(bytes) => {
                let cursor = Cursor::decode(bytes)?;
                self.snapshots.validate(cursor.snapshot_id)?;
                effective.offset = cursor.position as usize;
                cursor.snapshot_id
            }
            None => self.snapshots.register(),
        };

        let deadline = self.deadline(timeout_ms);
        let view = self.storage.snapshot_view();
        let executor = Executor::new(
            &view,
            &self.descriptors,
            &self.vectors,
            self.config.bm25,
            self.config.limits,
            deadline,
        );
        let rows = executor.execute(&effective)?;
        self.metrics.queries_executed.fetch_add(1, Ordering::Relaxed);

        // Continuation when a full page was produced.
        let cursor_out = match (effective.limit, rows.last()) {
            (Some(limit), Some(last)) if rows.len() == limit => Some(
                Cursor {
                    snapshot_id,
                    last_key: last.uuid.to_string().into_bytes(),
                    position: (effective.offset + rows.len()) as u64,
                }
                .encode()?,
            ),
            _ => None,
        };

        Ok(QueryOutput { rows, cursor: cursor_out, failing_shards: Vec::new() })
    }

    /// k-NN search with optional structured filter. The policy gate runs
    /// before any index access.
    pub fn vector_search(
        &self,
        collection: &str,
        field: &str,
        query: Vec<f32>,
        k: usize,
        filter: Option<Predicate>,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<(String, f32)>> {
        self.check_running()?;
        let _span = db_span(DbOperation::VectorSearch, Some(collection), None).entered();
        let desc = self.descriptors.load(collection)?;

        self.policy.check_vector_search(desc.classification)?;
        if self.policy.vector_requires_prefilter(desc.classification) && filter.is_none() {
            return Err(ThemisError::PolicyDenied);
        }

        let mut plan = QueryPlan::scan(collection);
        plan.predicate = filter;
        plan.vector = Some(VectorClause {
            field: field.to_string(),
            query,
            k,
            ef_search: None,
        });

        let deadline = self.deadline(timeout_ms);
        let view = self.storage.snapshot_view();
        let executor = Executor::new(
            &view,
            &self.descriptors,
            &self.vectors,
            self.config.bm25,
            self.config.limits,
            deadline,
        );
        let rows = executor.execute(&plan)?;

        let model = desc.urn_model.unwrap_or(crate::types::DataModel::Vector);
        let namespace = desc.urn_namespace.clone().unwrap_or_else(|| "default".into());
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    Urn::new(model, &namespace, collection, row.uuid).to_string(),
                    row.distance.unwrap_or(f32::MAX),
                )
            })
            .collect())
    }

    /// Bounded-depth graph traversal from a start vertex.
    pub fn graph_traverse(
        &self,
        start: &Urn,
        min_depth: usize,
        max_depth: usize,
        constraints: &TraversalConstraints,
    ) -> Result<Vec<TraversalPath>> {
        self.check_running()?;
        let _span =
            db_span(DbOperation::GraphTraverse, Some(&start.collection), Some(&start.namespace))
                .entered();
        let view = self.storage.snapshot_view();
        let traverser = Traverser::new(&view, &self.descriptors);
        traverser.bfs(start, min_depth, max_depth, constraints)
    }

    /// Shortest path between two vertices under the same constraint set.
    pub fn shortest_path(
        &self,
        start: &Urn,
        goal: &Urn,
        weight_field: Option<&str>,
        constraints: &TraversalConstraints,
    ) -> Result<Option<TraversalPath>> {
        self.check_running()?;
        let view = self.storage.snapshot_view();
        let traverser = Traverser::new(&view, &self.descriptors);
        traverser.shortest_path(start, goal, weight_field, constraints)
    }

    /// Reveal the original value behind a PII pseudonym. Role-gated.
    pub fn reveal_pii(&self, token: Uuid, role: &str) -> Result<String> {
        self.check_running()?;
        if !self.config.pii_reveal_roles.iter().any(|r| r == role) {
            return Err(ThemisError::PiiRevealDenied);
        }
        let value = self
            .storage
            .get(CF_PII_MAP, token.to_string().as_bytes())?
            .ok_or(ThemisError::NotFound(token))?;
        String::from_utf8(value).map_err(|_| ThemisError::IndexCorrupt("bad pii mapping".into()))
    }

    /// All sealed audit records, oldest first (auditor path).
    pub fn read_audit_records(&self, limit: usize) -> Result<Vec<SealedAuditRecord>> {
        let view = self.storage.snapshot_view();
        let entries = view.scan_prefix(CF_AUDIT, b"")?;
        entries
            .iter()
            .take(limit)
            .map(|(_, v)| Ok(bincode::deserialize(v)?))
            .collect()
    }

    /// Verify one sealed record against this node's key and decrypt it.
    pub fn verify_audit_record(&self, record: &SealedAuditRecord) -> Result<AuditEvent> {
        self.sealer.verify(record)
    }

    /// The node's audit verifying key (exported to auditors).
    pub fn audit_verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.sealer.verifying_key()
    }

    /// Retention sweep: drop time-series buckets of a series older than
    /// `before_ms`. Runs on the background worker cadence in production.
    pub fn sweep_series(&self, collection: &str, series_key: &str, before_ms: i64) -> Result<usize> {
        let _span = db_span(DbOperation::Sweep, Some(collection), None).entered();
        let view = self.storage.snapshot_view();
        let expired = timeseries::expired_buckets(&view, collection, series_key, before_ms)?;
        let count = expired.len();
        for key in expired {
            self.storage.delete(CF_TS, &key)?;
        }
        Ok(count)
    }

    /// Two-phase cross-collection join.
    ///
    /// The smaller side (by sampled entity count) is scattered first; its
    /// rows' `join_field` URNs are grouped by shard and fetched with one
    /// batch-get per shard, then paired with their left rows.
    pub async fn two_phase_join(
        &self,
        router: &crate::router::QueryRouter,
        side_a: &QueryPlan,
        side_b: &QueryPlan,
        join_field: &str,
        policy: crate::router::ScatterPolicy,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<(serde_json::Value, serde_json::Value)>> {
        self.check_running()?;
        let deadline_instant = self.deadline(timeout_ms);

        // Choose the smaller side as left.
        let (left, right) = {
            let view = self.storage.snapshot_view();
            let size_a =
                crate::query::planner::estimate_collection_size(&view, &side_a.collection)?;
            let size_b =
                crate::query::planner::estimate_collection_size(&view, &side_b.collection)?;
            if size_a <= size_b {
                (side_a, side_b)
            } else {
                (side_b, side_a)
            }
        };

        // Phase 1: scatter the left side, collect join keys.
        let shards = router.topology().shards();
        let request = ShardRequest::Query {
            plan: bincode::serialize(left)?,
            limit: left.limit,
            offset: left.offset,
        };
        let scattered = router
            .scatter_gather(&shards, request, policy, None, 0, deadline_instant)
            .await?;

        let mut keyed: Vec<(serde_json::Value, Uuid)> = Vec::new();
        for row in scattered.rows {
            let Some(urn_str) = row.payload.get(join_field).and_then(|v| v.as_str()) else {
                continue;
            };
            if let Ok(urn) = Urn::parse(urn_str) {
                keyed.push((row.payload, urn.uuid));
            }
        }

        // Phase 2: one batch-get per shard holding the join keys.
        let uuids: Vec<Uuid> = keyed.iter().map(|(_, u)| *u).collect();
        let fetched = router
            .grouped_batch_get(&right.collection, &uuids, deadline_instant)
            .await?;
        let by_uuid: std::collections::HashMap<Vec<u8>, serde_json::Value> = fetched
            .into_iter()
            .map(|row| (row.order_key, row.payload))
            .collect();

        Ok(keyed
            .into_iter()
            .filter_map(|(left_row, uuid)| {
                by_uuid
                    .get(uuid.to_string().as_bytes())
                    .map(|right_row| (left_row, right_row.clone()))
            })
            .collect())
    }

    /// Refresh the cached approximate count for one equality value. The
    /// planner reads the cache; sampling happens here, off the query
    /// path.
    pub fn refresh_count_cache(
        &self,
        collection: &str,
        field: &str,
        value: &crate::types::FieldValue,
    ) -> Result<u64> {
        let Some(value_bytes) = crate::codec::sortable::equality_bytes(value) else {
            return Ok(0);
        };
        let prefix =
            crate::storage::keys::index_value_prefix(collection, field, &value_bytes);
        let view = self.storage.snapshot_view();
        let count = view.count_prefix(crate::storage::CF_IDX_EQ, &prefix, 1_000_000)? as u64;
        if let Some((key, bytes)) =
            crate::index::secondary::count_cache_entry(collection, field, value, count)
        {
            self.storage.put(crate::storage::CF_META, &key, &bytes)?;
        }
        Ok(count)
    }

    /// Handle one shard-level request (the transport adapter calls this
    /// on the receiving side of scatter-gather).
    pub fn execute_shard_request(&self, request: &ShardRequest) -> Result<ShardResponse> {
        match request {
            ShardRequest::Query { plan, limit, offset } => {
                let plan: QueryPlan = bincode::deserialize(plan)
                    .map_err(|_| ThemisError::Parse("malformed shard plan".into()))?;
                let mut plan = plan;
                plan.limit = *limit;
                plan.offset = *offset;
                let output = self.query(&plan, None, None)?;
                Ok(ShardResponse {
                    rows: output
                        .rows
                        .into_iter()
                        .map(|row| ShardRow {
                            order_key: row.uuid.to_string().into_bytes(),
                            payload: row
                                .entity
                                .map(|e| e.to_json())
                                .unwrap_or(serde_json::Value::Null),
                        })
                        .collect(),
                })
            }
            ShardRequest::BatchGet { collection, uuids } => {
                let desc = self.descriptors.load(collection)?;
                let view = self.storage.snapshot_view();
                let mut rows = Vec::with_capacity(uuids.len());
                for &uuid in uuids {
                    if let Some(blob) = view.get(CF_ENTITY, &entity_key(collection, uuid))? {
                        rows.push(ShardRow {
                            order_key: uuid.to_string().into_bytes(),
                            payload: codec::decode(&blob, &desc.fields)?.to_json(),
                        });
                    }
                }
                Ok(ShardResponse { rows })
            }
        }
    }

    /// Stop accepting work, drain background workers, persist snapshots,
    /// flush. Safe to call once.
    pub async fn close(&self) -> Result<()> {
        self.state.store(STATE_DRAINING, Ordering::SeqCst);
        // Drain: apply whatever intents are still queued.
        self.vectors.apply_pending()?;
        self.vectors.snapshot_all()?;
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        let workers = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            worker.abort();
            let _ = worker.await;
        }
        // Durability rests on the engine WAL; no explicit flush needed.
        info!("database closed");
        Ok(())
    }

    /// Direct access for the admission adapter and tests.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn vectors(&self) -> &VectorIndexRegistry {
        &self.vectors
    }

    pub fn descriptors(&self) -> &DescriptorCache {
        &self.descriptors
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Policy checks that must run before any index access.
    fn gate_plan(&self, plan: &QueryPlan) -> Result<()> {
        if plan.vector.is_some() {
            let desc = self.descriptors.load(&plan.collection)?;
            self.policy.check_vector_search(desc.classification)?;
            if self.policy.vector_requires_prefilter(desc.classification)
                && plan.predicate.is_none()
                && plan.spatial.is_none()
            {
                return Err(ThemisError::PolicyDenied);
            }
        }
        if let Some(spatial) = &plan.spatial {
            let mbr = spatial.predicate.query_mbr();
            if mbr.crosses_antimeridian() {
                return Err(ThemisError::invalid(
                    "query MBR crosses the antimeridian; split the query at ±180°",
                ));
            }
        }
        Ok(())
    }

    fn audit_read(&self, urn: &Urn, actor: &str, action: &str) -> Result<()> {
        let desc = self.descriptors.load(&urn.collection)?;
        let event = AuditEvent::new(
            AuditCategory::Read,
            actor,
            &urn.to_string(),
            action,
            desc.classification,
        );
        let double = self.policy.level(desc.classification).double_encrypt;
        let record = self.sealer.seal(&event, double)?;
        self.storage.put(
            CF_AUDIT,
            &audit_key(event.ts, event.id),
            &bincode::serialize(&record)?,
        )
    }
}

/// In-process transport: routes shard requests straight back into a
/// local database. Verifies envelopes like a remote receiver would.
pub struct InProcessShardClient {
    db: Arc<Database>,
    nonces: crate::router::NonceCache,
    verifying: ed25519_dalek::VerifyingKey,
}

impl InProcessShardClient {
    pub fn new(db: Arc<Database>, verifying: ed25519_dalek::VerifyingKey) -> Self {
        Self { db, nonces: crate::router::NonceCache::new(), verifying }
    }
}

#[async_trait::async_trait]
impl crate::router::ShardClient for InProcessShardClient {
    async fn execute(
        &self,
        _shard: &crate::router::ShardInfo,
        envelope: crate::router::SignedEnvelope,
    ) -> Result<ShardResponse> {
        envelope.verify(&self.verifying, &self.nonces)?;
        let request: ShardRequest = bincode::deserialize(&envelope.payload)
            .map_err(|_| ThemisError::Parse("malformed shard request".into()))?;
        self.db.execute_shard_request(&request)
    }
}

/// All entities referenced by a whitelist that are missing from the
/// collection — used by integration tests asserting index soundness.
pub fn missing_from_primary(db: &Database, collection: &str, uuids: &HashSet<Uuid>) -> Vec<Uuid> {
    uuids
        .iter()
        .filter(|uuid| {
            db.storage()
                .get(CF_ENTITY, &entity_key(collection, **uuid))
                .map(|b| b.is_none())
                .unwrap_or(true)
        })
        .copied()
        .collect()
}
