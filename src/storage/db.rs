//! RocksDB wrapper.
//!
//! Thin typed layer over a pessimistic `TransactionDB`: column-family
//! handles, point reads, snapshot-pinned range scans, and transaction
//! construction. All multi-key atomicity flows through `txn::Txn`, never
//! through bare puts.

use crate::storage::column_families::create_column_family_descriptors;
use crate::storage::keys::prefix_upper_bound;
use crate::types::{Result, ThemisError};
use rocksdb::{
    BoundColumnFamily, Direction, IteratorMode, MultiThreaded, Options, ReadOptions,
    SnapshotWithThreadMode, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) type Db = TransactionDB<MultiThreaded>;

/// Default number of rows pulled per scan batch; deadline checks run
/// between batches, not per element.
pub const SCAN_BATCH_SIZE: usize = 1024;

/// Storage engine handle. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Db>,
    path: PathBuf,
}

impl Storage {
    /// Open (or create) the database at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_background_jobs(4);
        opts.set_bytes_per_sync(1_048_576);

        let txn_opts = TransactionDBOptions::default();
        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &txn_opts,
            path.as_ref(),
            create_column_family_descriptors(),
        )?;

        Ok(Self { db: Arc::new(db), path: path.as_ref().to_path_buf() })
    }

    /// Filesystem path the engine was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ThemisError::internal(format!("column family not found: {name}")))
    }

    pub(crate) fn inner(&self) -> &Db {
        &self.db
    }

    /// Point read at the latest committed state.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Direct put outside any transaction. Reserved for single-key state
    /// owned by exactly one writer (applier watermarks, count cache).
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.put_cf(&cf, key, value)?)
    }

    /// Direct delete outside any transaction.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.delete_cf(&cf, key)?)
    }

    /// Begin a pessimistic transaction with a read snapshot.
    pub fn begin(&self) -> Transaction<'_, Db> {
        let mut topts = TransactionOptions::default();
        topts.set_snapshot(true);
        self.db.transaction_opt(&WriteOptions::default(), &topts)
    }

    /// Pin a read snapshot for a query.
    pub fn snapshot_view(&self) -> SnapshotView<'_> {
        SnapshotView { storage: self, snap: self.db.snapshot() }
    }
}

/// A pinned read snapshot over the storage engine.
///
/// Every query primitive reads through one of these so that all
/// primitives in a plan observe the same point-in-time state.
pub struct SnapshotView<'a> {
    storage: &'a Storage,
    snap: SnapshotWithThreadMode<'a, Db>,
}

impl<'a> SnapshotView<'a> {
    fn read_opts(&self) -> ReadOptions {
        let mut ro = ReadOptions::default();
        ro.set_snapshot(&self.snap);
        ro
    }

    /// Point read under the snapshot.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.storage.cf(cf_name)?;
        Ok(self
            .storage
            .db
            .get_cf_opt(&cf, key, &self.read_opts())?)
    }

    /// Ordered multi-get under the snapshot. Output order matches input;
    /// missing keys yield `None`.
    pub fn multi_get(&self, cf_name: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let cf = self.storage.cf(cf_name)?;
        let ro = self.read_opts();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.storage.db.get_cf_opt(&cf, key, &ro)?);
        }
        Ok(out)
    }

    /// One batch of a `[lower, upper)` range scan, starting at `resume`
    /// (exclusive) when provided. Returns at most `limit` pairs; an empty
    /// batch means the range is exhausted.
    pub fn scan_batch(
        &self,
        cf_name: &str,
        lower: &[u8],
        upper: &[u8],
        resume_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.storage.cf(cf_name)?;
        let mut ro = self.read_opts();
        ro.set_iterate_upper_bound(upper.to_vec());

        let start: Vec<u8> = match resume_after {
            // Successor key: resume strictly after the last seen key.
            Some(last) => {
                let mut s = last.to_vec();
                s.push(0x00);
                s
            }
            None => lower.to_vec(),
        };

        let iter = self.storage.db.iterator_cf_opt(
            &cf,
            ro,
            IteratorMode::From(&start, Direction::Forward),
        );

        let mut out = Vec::with_capacity(limit.min(SCAN_BATCH_SIZE));
        for item in iter {
            let (k, v) = item?;
            if k.as_ref() >= upper {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Full prefix scan collected into memory. For bounded metadata sets
    /// only; query paths use `scan_batch`.
    pub fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_upper_bound(prefix);
        let mut out = Vec::new();
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let batch = self.scan_batch(
                cf_name,
                prefix,
                &upper,
                resume.as_deref(),
                SCAN_BATCH_SIZE,
            )?;
            if batch.is_empty() {
                return Ok(out);
            }
            resume = Some(batch.last().unwrap().0.clone());
            out.extend(batch);
        }
    }

    /// Count keys under a prefix, stopping at `cap`. The planner's
    /// sampled-selectivity probe.
    pub fn count_prefix(&self, cf_name: &str, prefix: &[u8], cap: usize) -> Result<usize> {
        let upper = prefix_upper_bound(prefix);
        let mut count = 0usize;
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let batch = self.scan_batch(
                cf_name,
                prefix,
                &upper,
                resume.as_deref(),
                SCAN_BATCH_SIZE.min(cap - count),
            )?;
            if batch.is_empty() {
                return Ok(count);
            }
            count += batch.len();
            if count >= cap {
                return Ok(count);
            }
            resume = Some(batch.last().unwrap().0.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column_families::{CF_ENTITY, CF_IDX_EQ};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open_put_get() {
        let (_dir, storage) = open_temp();
        storage.put(CF_ENTITY, b"k1", b"v1").unwrap();
        assert_eq!(storage.get(CF_ENTITY, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(storage.get(CF_ENTITY, b"missing").unwrap(), None);
    }

    #[test]
    fn test_snapshot_isolation_for_reads() {
        let (_dir, storage) = open_temp();
        storage.put(CF_ENTITY, b"k", b"old").unwrap();
        let view = storage.snapshot_view();
        storage.put(CF_ENTITY, b"k", b"new").unwrap();
        // The pinned view still sees the old value.
        assert_eq!(view.get(CF_ENTITY, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(storage.get(CF_ENTITY, b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_scan_batch_bounds_and_resume() {
        let (_dir, storage) = open_temp();
        for i in 0..10u8 {
            storage.put(CF_IDX_EQ, &[b'a', i], &[i]).unwrap();
        }
        storage.put(CF_IDX_EQ, b"b0", b"x").unwrap();

        let view = storage.snapshot_view();
        let lower = vec![b'a', 0];
        let upper = vec![b'a', 10];

        let first = view.scan_batch(CF_IDX_EQ, &lower, &upper, None, 4).unwrap();
        assert_eq!(first.len(), 4);
        let second = view
            .scan_batch(CF_IDX_EQ, &lower, &upper, Some(&first.last().unwrap().0), 100)
            .unwrap();
        assert_eq!(second.len(), 6);
        let done = view
            .scan_batch(CF_IDX_EQ, &lower, &upper, Some(&second.last().unwrap().0), 100)
            .unwrap();
        assert!(done.is_empty());
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let (_dir, storage) = open_temp();
        let cf = storage.cf(CF_ENTITY).unwrap();

        let txn = storage.begin();
        txn.put_cf(&cf, b"a", b"1").unwrap();
        txn.commit().unwrap();
        assert_eq!(storage.get(CF_ENTITY, b"a").unwrap(), Some(b"1".to_vec()));

        let txn = storage.begin();
        txn.put_cf(&cf, b"b", b"2").unwrap();
        txn.rollback().unwrap();
        assert_eq!(storage.get(CF_ENTITY, b"b").unwrap(), None);
    }

    #[test]
    fn test_count_prefix_cap() {
        let (_dir, storage) = open_temp();
        for i in 0..20u8 {
            storage.put(CF_IDX_EQ, &[b'p', i], b"").unwrap();
        }
        let view = storage.snapshot_view();
        assert_eq!(view.count_prefix(CF_IDX_EQ, b"p", 100).unwrap(), 20);
        assert_eq!(view.count_prefix(CF_IDX_EQ, b"p", 5).unwrap(), 5);
    }
}
