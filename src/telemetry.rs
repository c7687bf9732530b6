//! Tracing instrumentation and metrics gauges.
//!
//! Spans follow the OpenTelemetry database semantic conventions:
//! span name `{db.operation.name} {target}`, `db.system.name`,
//! `db.collection.name`, `db.namespace`. Metrics are plain atomics
//! scraped by the embedding process.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{span, Level, Span};

/// Database operation types (maps to `db.operation.name`).
#[derive(Debug, Clone, Copy)]
pub enum DbOperation {
    Get,
    Put,
    Delete,
    BatchGet,
    Query,
    VectorSearch,
    GraphTraverse,
    Sweep,
}

impl DbOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::BatchGet => "batch_get",
            Self::Query => "query",
            Self::VectorSearch => "vector_search",
            Self::GraphTraverse => "graph_traverse",
            Self::Sweep => "sweep",
        }
    }
}

/// Create a database operation span with semantic attributes.
pub fn db_span(operation: DbOperation, collection: Option<&str>, namespace: Option<&str>) -> Span {
    let span_name = match collection {
        Some(coll) => format!("{} {}", operation.as_str(), coll),
        None => operation.as_str().to_string(),
    };
    let span = span!(
        Level::INFO,
        "db",
        otel.name = %span_name,
        otel.kind = "client",
        db.system.name = "rocksdb",
        db.operation.name = operation.as_str(),
        db.collection.name = tracing::field::Empty,
        db.namespace = tracing::field::Empty,
    );
    if let Some(coll) = collection {
        span.record("db.collection.name", coll);
    }
    if let Some(ns) = namespace {
        span.record("db.namespace", ns);
    }
    span
}

/// Process-wide gauges the spec requires to be observable.
#[derive(Debug, Default)]
pub struct Metrics {
    pub vector_intent_queue_depth: AtomicU64,
    pub vector_apply_lag_ms: AtomicU64,
    pub queries_executed: AtomicU64,
    pub entities_written: AtomicU64,
}

impl Metrics {
    pub fn record_vector_state(&self, depth: usize, lag_ms: u64) {
        self.vector_intent_queue_depth
            .store(depth as u64, Ordering::Relaxed);
        self.vector_apply_lag_ms.store(lag_ms, Ordering::Relaxed);
    }
}
