//! ThemisDB — single-node multi-model database.
//!
//! Relational rows, graph vertices and edges, high-dimensional vectors,
//! time-series points and content chunks all live as one entity kind in
//! one transactional RocksDB engine. Index projections (secondary,
//! range, full-text BM25, graph adjacency, spatial Morton, time
//! buckets) mutate atomically with the entity; the HNSW vector index is
//! fed by an intent log with bounded staleness. Hybrid queries compose
//! relational filters, full-text, graph traversal, spatial predicates
//! and k-NN in one execution over one snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use themis_db::{Database, DatabaseConfig, Urn};
//! use serde_json::json;
//!
//! # fn main() -> themis_db::Result<()> {
//! let db = Database::open(DatabaseConfig::at_path("./data"))?;
//! let urn: Urn = "urn:themis:relational:tenant:users:8f14e45f-ceea-4e7f-a2f0-946c61bfb0cd"
//!     .parse()?;
//! db.put(&urn, &json!({"age": 30, "name": "ada"}), "svc:ingest")?;
//! let row = db.get(&urn, "svc:api")?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod codec;
pub mod config;
pub mod database;
pub mod geo;
pub mod graph;
pub mod index;
pub mod query;
pub mod router;
pub mod storage;
pub mod telemetry;
pub mod txn;
pub mod types;

pub use config::{DatabaseConfig, QueryLimits};
pub use database::{Database, InProcessShardClient, QueryOutput};
pub use types::{DataModel, Entity, FieldValue, Result, ThemisError, Urn};

/// Initialize tracing from `RUST_LOG` (adapter binaries call this once).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
