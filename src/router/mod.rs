//! URN resolver and query router.
//!
//! Classifies queries into single-shard, restricted scatter, full
//! scatter or two-phase join, fans out concurrently, merges by the
//! query's ordering key, and applies LIMIT/OFFSET after the merge.
//! Remote invocations are signed (timestamp + nonce over mTLS); failures
//! retry with bounded exponential backoff before surfacing.

pub mod envelope;
pub mod ring;
pub mod topology;

pub use envelope::{NonceCache, SignedEnvelope, MAX_SKEW_MS};
pub use ring::{urn_token, HashRing, VNODES_PER_SHARD};
pub use topology::{MetadataService, ShardInfo, StaticMetadata, TopologyView};

use crate::types::{Result, ThemisError, Urn};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Retry schedule for retryable backend errors.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
];

/// A request shipped to one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardRequest {
    /// Serialized plan fragment to execute against the shard's snapshot
    Query { plan: Vec<u8>, limit: Option<usize>, offset: usize },
    /// Ordered multi-get on primary keys
    BatchGet { collection: String, uuids: Vec<Uuid> },
}

/// One merged result row. `order_key` is the query's declared ordering
/// key encoded order-preservingly; rows from each shard arrive sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRow {
    pub order_key: Vec<u8>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardResponse {
    pub rows: Vec<ShardRow>,
}

/// Transport to a shard. The in-process implementation backs the
/// single-node deployment; a remote implementation is the mTLS adapter.
#[async_trait]
pub trait ShardClient: Send + Sync {
    async fn execute(&self, shard: &ShardInfo, envelope: SignedEnvelope) -> Result<ShardResponse>;
}

/// How a query routes.
#[derive(Debug, Clone)]
pub enum Routing {
    /// URN-keyed get/put/delete: primary only
    SingleShard(ShardInfo),
    /// Namespace+collection pinned: healthy shards only
    RestrictedScatter(Vec<ShardInfo>),
    /// No shard-pinning predicate: everything
    FullScatter(Vec<ShardInfo>),
}

/// Partial-failure policy for scatter-gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterPolicy {
    FailFast,
    BestEffort,
}

/// Scatter counters surfaced to metrics.
#[derive(Debug, Default)]
pub struct RouterCounters {
    pub local_requests: AtomicU64,
    pub remote_requests: AtomicU64,
    pub errors: AtomicU64,
}

/// Merged scatter result.
#[derive(Debug)]
pub struct ScatterResult {
    pub rows: Vec<ShardRow>,
    /// Non-empty only in best-effort mode
    pub failing_shards: Vec<String>,
}

pub struct QueryRouter {
    topology: Arc<TopologyView>,
    client: Arc<dyn ShardClient>,
    signing: SigningKey,
    local_shard_id: String,
    pub counters: RouterCounters,
}

impl QueryRouter {
    pub fn new(
        topology: Arc<TopologyView>,
        client: Arc<dyn ShardClient>,
        signing: SigningKey,
        local_shard_id: &str,
    ) -> Self {
        Self {
            topology,
            client,
            signing,
            local_shard_id: local_shard_id.to_string(),
            counters: RouterCounters::default(),
        }
    }

    pub fn topology(&self) -> &TopologyView {
        &self.topology
    }

    /// Resolve a URN to its primary shard and replica set.
    pub fn resolve(&self, urn: &Urn, replica_count: usize) -> Result<(ShardInfo, Vec<ShardInfo>)> {
        self.topology.resolve(urn.uuid, replica_count)
    }

    /// Route classification per query shape.
    pub fn classify(&self, urn: Option<&Urn>, namespace_pinned: bool) -> Result<Routing> {
        if let Some(urn) = urn {
            let (primary, _) = self.resolve(urn, 0)?;
            return Ok(Routing::SingleShard(primary));
        }
        let shards = self.topology.shards();
        if shards.is_empty() {
            return Err(ThemisError::BackendUnavailable("empty topology".into()));
        }
        if namespace_pinned {
            let healthy: Vec<ShardInfo> = shards.into_iter().filter(|s| s.healthy).collect();
            Ok(Routing::RestrictedScatter(healthy))
        } else {
            Ok(Routing::FullScatter(shards))
        }
    }

    /// Execute one request against one shard, with backoff on retryable
    /// errors and the deadline honored around every attempt.
    pub async fn execute_on(
        &self,
        shard: &ShardInfo,
        request: &ShardRequest,
        deadline: Instant,
    ) -> Result<ShardResponse> {
        if shard.id == self.local_shard_id {
            self.counters.local_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.remote_requests.fetch_add(1, Ordering::Relaxed);
        }

        let payload = bincode::serialize(request)?;
        let mut last_err: Option<ThemisError> = None;
        for (attempt, backoff) in std::iter::once(Duration::ZERO)
            .chain(RETRY_BACKOFF)
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(ThemisError::Timeout);
            }
            let envelope =
                SignedEnvelope::seal(payload.clone(), &self.local_shard_id, &self.signing);
            match tokio::time::timeout(remaining, self.client.execute(shard, envelope)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) if err.is_retryable() => {
                    warn!(shard = %shard.id, %err, attempt, "retrying shard request");
                    last_err = Some(err);
                }
                Ok(Err(err)) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Err(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(ThemisError::Timeout);
                }
            }
        }
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        Err(match last_err {
            Some(ThemisError::ShardUnreachable(s)) => ThemisError::ShardUnreachable(s),
            Some(_) | None => ThemisError::ShardUnreachable(shard.id.clone()),
        })
    }

    /// Scatter a request, gather concurrently, merge by ordering key,
    /// apply LIMIT/OFFSET after the merge.
    pub async fn scatter_gather(
        &self,
        shards: &[ShardInfo],
        request: ShardRequest,
        policy: ScatterPolicy,
        limit: Option<usize>,
        offset: usize,
        deadline: Instant,
    ) -> Result<ScatterResult> {
        let request = &request;
        let futures: Vec<_> = shards
            .iter()
            .map(|shard| async move {
                let result = self.execute_on(shard, request, deadline).await;
                (shard.id.clone(), result)
            })
            .collect();
        let results = join_all(futures).await;

        let mut rows: Vec<ShardRow> = Vec::new();
        let mut failing: Vec<String> = Vec::new();
        for (shard_id, result) in results {
            match result {
                Ok(response) => rows.extend(response.rows),
                Err(err) => match policy {
                    ScatterPolicy::FailFast => {
                        return Err(match err {
                            ThemisError::ShardUnreachable(_) => {
                                ThemisError::ShardUnreachable(shard_id)
                            }
                            other => other,
                        })
                    }
                    ScatterPolicy::BestEffort => failing.push(shard_id),
                },
            }
        }

        rows.sort_by(|a, b| a.order_key.cmp(&b.order_key));
        let rows: Vec<ShardRow> = rows
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        Ok(ScatterResult { rows, failing_shards: failing })
    }

    /// Phase 2 of a cross-shard join: group join keys by their URN shard
    /// and issue one batch-get per shard.
    pub async fn grouped_batch_get(
        &self,
        collection: &str,
        uuids: &[Uuid],
        deadline: Instant,
    ) -> Result<Vec<ShardRow>> {
        let mut by_shard: std::collections::HashMap<String, (ShardInfo, Vec<Uuid>)> =
            std::collections::HashMap::new();
        for &uuid in uuids {
            let (primary, _) = self.topology.resolve(uuid, 0)?;
            by_shard
                .entry(primary.id.clone())
                .or_insert_with(|| (primary, Vec::new()))
                .1
                .push(uuid);
        }

        let groups: Vec<(ShardInfo, ShardRequest)> = by_shard
            .into_values()
            .map(|(shard, group)| {
                (
                    shard,
                    ShardRequest::BatchGet {
                        collection: collection.to_string(),
                        uuids: group,
                    },
                )
            })
            .collect();
        let futures: Vec<_> = groups
            .iter()
            .map(|(shard, request)| self.execute_on(shard, request, deadline))
            .collect();

        let mut rows = Vec::new();
        for result in join_all(futures).await {
            rows.extend(result?.rows);
        }
        Ok(rows)
    }
}

/// Await a set of futures concurrently, preserving input order.
async fn join_all<F, T>(futures: Vec<F>) -> Vec<T>
where
    F: std::future::Future<Output = T>,
{
    use std::task::Poll;
    let mut pinned: Vec<std::pin::Pin<Box<F>>> = futures.into_iter().map(Box::pin).collect();
    let mut results: Vec<Option<T>> = pinned.iter().map(|_| None).collect();
    std::future::poll_fn(move |cx| {
        let mut all_done = true;
        for (i, fut) in pinned.iter_mut().enumerate() {
            if results[i].is_none() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(value) => results[i] = Some(value),
                    Poll::Pending => all_done = false,
                }
            }
        }
        if all_done {
            let out: Vec<T> = results.iter_mut().map(|r| r.take().unwrap()).collect();
            Poll::Ready(out)
        } else {
            Poll::Pending
        }
    })
    .await
}
