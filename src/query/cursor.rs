//! Cursor-based pagination.
//!
//! A cursor encodes `(snapshot_id, last_key, position)` and is opaque to
//! clients. Snapshot ids are registered with a creation time; continuing
//! a cursor whose snapshot fell out of the retention window fails with
//! `SnapshotExpired`.

use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Decoded cursor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub snapshot_id: u64,
    pub last_key: Vec<u8>,
    pub position: u64,
}

impl Cursor {
    /// Opaque wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|_| ThemisError::Parse("malformed cursor".into()))
    }
}

/// Registry of query snapshots with a retention window.
pub struct SnapshotRegistry {
    entries: Mutex<HashMap<u64, Instant>>,
    next_id: AtomicU64,
    retention: Duration,
}

impl SnapshotRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            retention,
        }
    }

    /// Register a fresh snapshot; returns its id.
    pub fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, created| now.duration_since(*created) <= self.retention);
        entries.insert(id, now);
        id
    }

    /// Validate a cursor's snapshot id against the retention window.
    pub fn validate(&self, snapshot_id: u64) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&snapshot_id) {
            Some(created) if created.elapsed() <= self.retention => Ok(()),
            _ => Err(ThemisError::SnapshotExpired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor { snapshot_id: 7, last_key: b"users:abc".to_vec(), position: 42 };
        let decoded = Cursor::decode(&cursor.encode().unwrap()).unwrap();
        assert_eq!(decoded.snapshot_id, 7);
        assert_eq!(decoded.last_key, b"users:abc");
        assert_eq!(decoded.position, 42);
    }

    #[test]
    fn test_malformed_cursor_is_parse_error() {
        assert!(matches!(
            Cursor::decode(b"nonsense"),
            Err(ThemisError::Parse(_))
        ));
    }

    #[test]
    fn test_registry_validates_live_snapshot() {
        let registry = SnapshotRegistry::new(Duration::from_secs(60));
        let id = registry.register();
        registry.validate(id).unwrap();
    }

    #[test]
    fn test_unknown_snapshot_is_expired() {
        let registry = SnapshotRegistry::new(Duration::from_secs(60));
        assert!(matches!(
            registry.validate(999),
            Err(ThemisError::SnapshotExpired)
        ));
    }

    #[test]
    fn test_expired_snapshot_rejected() {
        let registry = SnapshotRegistry::new(Duration::from_millis(1));
        let id = registry.register();
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(
            registry.validate(id),
            Err(ThemisError::SnapshotExpired)
        ));
    }
}
