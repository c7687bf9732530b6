//! Scatter-gather routing against live shard backends, with one shard
//! down.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use themis_db::query::QueryPlan;
use themis_db::router::{
    NonceCache, QueryRouter, ScatterPolicy, ShardClient, ShardInfo, ShardRequest, ShardResponse,
    SignedEnvelope, TopologyView,
};
use themis_db::types::{DataModel, Result, ThemisError, Urn};
use themis_db::{Database, DatabaseConfig};
use uuid::Uuid;

/// Shards 0 and 1 resolve to live databases; shard-2 is unreachable.
struct MixedClient {
    backends: std::collections::HashMap<String, Arc<Database>>,
    verifying: ed25519_dalek::VerifyingKey,
    nonces: NonceCache,
}

#[async_trait]
impl ShardClient for MixedClient {
    async fn execute(&self, shard: &ShardInfo, envelope: SignedEnvelope) -> Result<ShardResponse> {
        let Some(db) = self.backends.get(&shard.id) else {
            return Err(ThemisError::ShardUnreachable(shard.id.clone()));
        };
        envelope.verify(&self.verifying, &self.nonces)?;
        let request: ShardRequest = bincode::deserialize(&envelope.payload)
            .map_err(|_| ThemisError::Parse("malformed shard request".into()))?;
        db.execute_shard_request(&request)
    }
}

fn seed(db: &Database, count: usize) -> Vec<Uuid> {
    (0..count)
        .map(|i| {
            let urn = Urn::new(DataModel::Relational, "t", "users", Uuid::new_v4());
            db.put(&urn, &json!({"n": i as i64}), "t").unwrap();
            urn.uuid
        })
        .collect()
}

#[tokio::test]
async fn scatter_gather_fail_fast_vs_best_effort() {
    let dir0 = TempDir::new().unwrap();
    let dir1 = TempDir::new().unwrap();
    let db0 = Database::open(DatabaseConfig::at_path(dir0.path())).unwrap();
    let db1 = Database::open(DatabaseConfig::at_path(dir1.path())).unwrap();
    let on_0 = seed(&db0, 3);
    let on_1 = seed(&db1, 2);

    let topology = Arc::new(TopologyView::new());
    topology.refresh(
        (0..3)
            .map(|i| ShardInfo::local(&format!("shard-{i}")))
            .collect(),
    );

    let signing = SigningKey::generate(&mut OsRng);
    let client = Arc::new(MixedClient {
        backends: [
            ("shard-0".to_string(), Arc::clone(&db0)),
            ("shard-1".to_string(), Arc::clone(&db1)),
        ]
        .into_iter()
        .collect(),
        verifying: signing.verifying_key(),
        nonces: NonceCache::new(),
    });
    let router = QueryRouter::new(topology, client, signing, "shard-0");

    let plan = QueryPlan::scan("users");
    let request = ShardRequest::Query {
        plan: bincode::serialize(&plan).unwrap(),
        limit: None,
        offset: 0,
    };
    let shards = router.topology().shards();
    let deadline = Instant::now() + Duration::from_secs(10);

    // Fail-fast: the unreachable shard aborts the query.
    let err = router
        .scatter_gather(
            &shards,
            request.clone(),
            ScatterPolicy::FailFast,
            None,
            0,
            deadline,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ThemisError::ShardUnreachable(s) if s == "shard-2"));

    // Best-effort: union of the live shards plus failing-shard metadata.
    let result = router
        .scatter_gather(&shards, request, ScatterPolicy::BestEffort, None, 0, deadline)
        .await
        .unwrap();
    assert_eq!(result.failing_shards, vec!["shard-2".to_string()]);
    assert_eq!(result.rows.len(), on_0.len() + on_1.len());

    let returned: std::collections::HashSet<Vec<u8>> =
        result.rows.iter().map(|r| r.order_key.clone()).collect();
    for uuid in on_0.iter().chain(&on_1) {
        assert!(returned.contains(uuid.to_string().as_bytes()));
    }
}

#[tokio::test]
async fn cross_shard_join_phase_two_groups_by_shard() {
    let dir0 = TempDir::new().unwrap();
    let db0 = Database::open(DatabaseConfig::at_path(dir0.path())).unwrap();
    let uuids = seed(&db0, 4);

    let topology = Arc::new(TopologyView::new());
    topology.refresh(vec![ShardInfo::local("shard-0")]);

    let signing = SigningKey::generate(&mut OsRng);
    let client = Arc::new(MixedClient {
        backends: [("shard-0".to_string(), Arc::clone(&db0))].into_iter().collect(),
        verifying: signing.verifying_key(),
        nonces: NonceCache::new(),
    });
    let router = QueryRouter::new(topology, client, signing, "shard-0");

    let rows = router
        .grouped_batch_get("users", &uuids, Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
}
