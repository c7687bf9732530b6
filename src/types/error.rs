//! Error taxonomy for ThemisDB operations.
//!
//! One variant per externally visible error kind. Uses `thiserror` for
//! ergonomic definitions with automatic `From` implementations for the
//! storage and serialization layers.

use thiserror::Error;
use uuid::Uuid;

/// Comprehensive error type for all database operations.
///
/// Variants map one-to-one onto the kinds surfaced at the operation API;
/// callers match on the variant, not on message text.
#[derive(Error, Debug)]
pub enum ThemisError {
    // --- Input errors: never retried, surfaced verbatim ---
    /// Query plan or parameter could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// Entity blob failed structural decoding
    #[error("Malformed blob: {0}")]
    MalformedBlob(String),

    /// Field id not present in the collection descriptor
    #[error("Unknown field id: {0}")]
    UnknownFieldId(u32),

    /// Field name not known to the collection
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// Field value had an unexpected type tag
    #[error("Type mismatch for field {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Query vector length differs from the collection's embedding dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// URN string violated the `urn:themis:{model}:{namespace}:{collection}:{uuid}` grammar
    #[error("Invalid URN: {0}")]
    InvalidUrn(String),

    /// Structurally invalid input (e.g. antimeridian-crossing MBR)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Authorization / policy: surfaced opaquely ---
    /// Operation rejected by the governance policy
    #[error("Permission denied")]
    PolicyDenied,

    /// Actor's clearance is below the resource classification
    #[error("Permission denied")]
    ClassificationTooHigh,

    /// PII reveal requested without the required role
    #[error("Permission denied")]
    PiiRevealDenied,

    // --- Concurrency ---
    /// Write-write conflict on a locked key; includes the conflicting URN
    #[error("Conflict on {urn}")]
    Conflict { urn: String },

    /// Cursor references a snapshot beyond the retention window
    #[error("Snapshot expired")]
    SnapshotExpired,

    // --- Resource ---
    /// Deadline elapsed before the operation finished
    #[error("Timeout")]
    Timeout,

    /// Operation cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Admission or queue-depth limit reached
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// Vector intent queue exceeded its configured bound
    #[error("Index backlog: {0} pending intents")]
    IndexBacklog(usize),

    /// Graph traversal exceeded its edge budget
    #[error("Cycle budget exhausted after {0} edges")]
    CycleBudget(usize),

    // --- Backend ---
    /// Storage engine unavailable or in an unrecoverable state
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Index entry failed structural validation during a scan
    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    /// Remote shard did not respond within the retry budget
    #[error("Shard unreachable: {0}")]
    ShardUnreachable(String),

    /// Entity not found by URN
    #[error("Entity not found: {0}")]
    NotFound(Uuid),

    // --- Partial (best-effort scatter only) ---
    /// Partial result with the shards that failed
    #[error("Partial result; failing shards: {failing_shards:?}")]
    PartialResult { failing_shards: Vec<String> },

    // --- Infrastructure conversions ---
    /// Storage layer error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bincode serialization error
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ThemisError>;

impl ThemisError {
    /// Create a malformed-blob error with context.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBlob(msg.into())
    }

    /// Create an invalid-input error with context.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error with context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the router may retry this error with backoff.
    ///
    /// Only backend-availability kinds are retryable. Input, policy and
    /// concurrency errors are surfaced immediately; `Conflict` retries are
    /// the admission layer's business, not the core's.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::ShardUnreachable(_)
        )
    }

    /// Compact `{kind, message}` record for the interface layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "Parse",
            Self::MalformedBlob(_) => "MalformedBlob",
            Self::UnknownFieldId(_) => "UnknownFieldId",
            Self::UnknownField(_) => "UnknownField",
            Self::TypeMismatch { .. } => "TypeMismatch",
            Self::DimensionMismatch { .. } => "DimensionMismatch",
            Self::InvalidUrn(_) => "InvalidURN",
            Self::InvalidInput(_) => "InvalidInput",
            Self::PolicyDenied => "PolicyDenied",
            Self::ClassificationTooHigh => "ClassificationTooHigh",
            Self::PiiRevealDenied => "PIIRevealDenied",
            Self::Conflict { .. } => "Conflict",
            Self::SnapshotExpired => "SnapshotExpired",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Overloaded(_) => "Overloaded",
            Self::IndexBacklog(_) => "IndexBacklog",
            Self::CycleBudget(_) => "CycleBudget",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::IndexCorrupt(_) => "IndexCorrupt",
            Self::ShardUnreachable(_) => "ShardUnreachable",
            Self::NotFound(_) => "NotFound",
            Self::PartialResult { .. } => "PartialResult",
            Self::Storage(_) => "BackendUnavailable",
            Self::Json(_) => "Parse",
            Self::Bincode(_) => "MalformedBlob",
            Self::Io(_) => "BackendUnavailable",
            Self::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ThemisError::ShardUnreachable("shard-2".into()).is_retryable());
        assert!(ThemisError::BackendUnavailable("stall".into()).is_retryable());
        assert!(!ThemisError::Conflict { urn: "urn:themis:relational:t:users:x".into() }.is_retryable());
        assert!(!ThemisError::Timeout.is_retryable());
    }

    #[test]
    fn test_policy_errors_are_opaque() {
        // Policy rejections must not fingerprint the policy in their message.
        assert_eq!(ThemisError::PolicyDenied.to_string(), "Permission denied");
        assert_eq!(ThemisError::ClassificationTooHigh.to_string(), "Permission denied");
        assert_eq!(ThemisError::PiiRevealDenied.to_string(), "Permission denied");
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ThemisError::SnapshotExpired.kind(), "SnapshotExpired");
        assert_eq!(
            ThemisError::DimensionMismatch { expected: 128, actual: 64 }.kind(),
            "DimensionMismatch"
        );
    }
}
