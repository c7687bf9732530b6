//! Full-text inverted index with BM25 scoring.
//!
//! Postings live in the `idx_ft` CF under `p:` keys, one per
//! (token, document); a `d:` sidecar carries the document length and an
//! `s:` record the per-(collection, field) corpus statistics. Scores are
//! both a candidate set and a ranking signal for the executor.

pub mod analyzer;

pub use analyzer::{analyze, porter_stem, term_frequencies};

use crate::storage::keys::{
    ft_doclen_key, ft_posting_key, ft_stats_key, ft_token_prefix, prefix_upper_bound,
};
use crate::storage::{SnapshotView, CF_IDX_FT, SCAN_BATCH_SIZE};
use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// BM25 parameters, configurable per database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// One posting value: term frequency in the document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Posting {
    pub tf: u32,
}

/// Corpus statistics for one (collection, field).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FtStats {
    pub doc_count: u64,
    pub total_len: u64,
}

impl FtStats {
    pub fn avg_doc_len(&self) -> f32 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.total_len as f32 / self.doc_count as f32
        }
    }
}

/// Staged key/value mutations for one document's text field, produced by
/// the transaction manager from pre- and post-image text.
#[derive(Debug, Default)]
pub struct FtDelta {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
    /// (doc_count delta, total_len delta) applied to the stats record
    pub stats_delta: (i64, i64),
}

/// Compute the index delta between the pre-image and post-image text of
/// one document field.
pub fn compute_delta(
    collection: &str,
    field: &str,
    uuid: Uuid,
    pre_text: Option<&str>,
    post_text: Option<&str>,
) -> Result<FtDelta> {
    let mut delta = FtDelta::default();

    if let Some(pre) = pre_text {
        let tf = term_frequencies(pre);
        for token in tf.keys() {
            delta
                .deletes
                .push(ft_posting_key(collection, field, token, uuid));
        }
        delta.deletes.push(ft_doclen_key(collection, field, uuid));
        let len: u32 = tf.values().sum();
        delta.stats_delta.0 -= 1;
        delta.stats_delta.1 -= len as i64;
    }

    if let Some(post) = post_text {
        let tf = term_frequencies(post);
        let len: u32 = tf.values().sum();
        for (token, freq) in &tf {
            delta.puts.push((
                ft_posting_key(collection, field, token, uuid),
                bincode::serialize(&Posting { tf: *freq })?,
            ));
        }
        delta
            .puts
            .push((ft_doclen_key(collection, field, uuid), len.to_le_bytes().to_vec()));
        delta.stats_delta.0 += 1;
        delta.stats_delta.1 += len as i64;
    }

    Ok(delta)
}

/// Apply a stats delta to a loaded record.
pub fn apply_stats_delta(stats: FtStats, delta: (i64, i64)) -> FtStats {
    FtStats {
        doc_count: (stats.doc_count as i64 + delta.0).max(0) as u64,
        total_len: (stats.total_len as i64 + delta.1).max(0) as u64,
    }
}

/// Read the stats record under a snapshot.
pub fn load_stats(view: &SnapshotView<'_>, collection: &str, field: &str) -> Result<FtStats> {
    match view.get(CF_IDX_FT, &ft_stats_key(collection, field))? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(FtStats::default()),
    }
}

/// Document frequency of a single term, capped at `cap` (the planner's
/// cheap selectivity upper bound).
pub fn term_doc_frequency(
    view: &SnapshotView<'_>,
    collection: &str,
    field: &str,
    term: &str,
    cap: usize,
) -> Result<usize> {
    let prefix = ft_token_prefix(collection, field, term);
    view.count_prefix(CF_IDX_FT, &prefix, cap)
}

/// BM25 search: analyze the query, merge postings per term, score, sort
/// descending. A term with document frequency zero contributes nothing —
/// no scoring division by zero.
pub fn search_bm25(
    view: &SnapshotView<'_>,
    collection: &str,
    field: &str,
    query: &str,
    params: Bm25Params,
    limit: usize,
) -> Result<Vec<(Uuid, f32)>> {
    let stats = load_stats(view, collection, field)?;
    if stats.doc_count == 0 {
        return Ok(Vec::new());
    }
    let n = stats.doc_count as f32;
    let avgdl = stats.avg_doc_len().max(1.0);

    // token -> [(uuid, tf)]
    let mut per_term: Vec<Vec<(Uuid, u32)>> = Vec::new();
    for token in analyze(query) {
        let prefix = ft_token_prefix(collection, field, &token);
        let upper = prefix_upper_bound(&prefix);
        let mut postings = Vec::new();
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let batch =
                view.scan_batch(CF_IDX_FT, &prefix, &upper, resume.as_deref(), SCAN_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            for (key, value) in &batch {
                let uuid = crate::storage::keys::decode_index_key_uuid(key)?;
                let posting: Posting = bincode::deserialize(value)?;
                postings.push((uuid, posting.tf));
            }
            resume = Some(batch.last().unwrap().0.clone());
        }
        if !postings.is_empty() {
            per_term.push(postings);
        }
    }

    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    for postings in &per_term {
        let df = postings.len() as f32;
        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
        for &(uuid, tf) in postings {
            let dl = doc_len(view, collection, field, uuid)?.unwrap_or(0) as f32;
            let tf = tf as f32;
            let denom = tf + params.k1 * (1.0 - params.b + params.b * dl / avgdl);
            let score = idf * tf * (params.k1 + 1.0) / denom;
            *scores.entry(uuid).or_insert(0.0) += score;
        }
    }

    let mut ranked: Vec<(Uuid, f32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(limit);
    Ok(ranked)
}

fn doc_len(
    view: &SnapshotView<'_>,
    collection: &str,
    field: &str,
    uuid: Uuid,
) -> Result<Option<u32>> {
    Ok(view
        .get(CF_IDX_FT, &ft_doclen_key(collection, field, uuid))?
        .and_then(|b| b.try_into().ok().map(u32::from_le_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn index_doc(storage: &Storage, uuid: Uuid, text: &str, stats: &mut FtStats) {
        let delta = compute_delta("docs", "text_content", uuid, None, Some(text)).unwrap();
        for (k, v) in &delta.puts {
            storage.put(CF_IDX_FT, k, v).unwrap();
        }
        *stats = apply_stats_delta(*stats, delta.stats_delta);
        storage
            .put(
                CF_IDX_FT,
                &ft_stats_key("docs", "text_content"),
                &bincode::serialize(stats).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn test_bm25_ranks_relevant_doc_first() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut stats = FtStats::default();

        let relevant = Uuid::new_v4();
        let other = Uuid::new_v4();
        index_doc(
            &storage,
            relevant,
            "rust database engine with vector search and rust speed",
            &mut stats,
        );
        index_doc(&storage, other, "gardening tips for spring flowers", &mut stats);

        let view = storage.snapshot_view();
        let hits =
            search_bm25(&view, "docs", "text_content", "rust database", Bm25Params::default(), 10)
                .unwrap();
        assert_eq!(hits[0].0, relevant);
        assert!(hits[0].1 > 0.0);
        assert!(hits.iter().all(|(u, _)| *u != other));
    }

    #[test]
    fn test_zero_df_term_returns_empty() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut stats = FtStats::default();
        index_doc(&storage, Uuid::new_v4(), "some indexed text", &mut stats);

        let view = storage.snapshot_view();
        let hits = search_bm25(
            &view,
            "docs",
            "text_content",
            "zzzunseen",
            Bm25Params::default(),
            10,
        )
        .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_empty_corpus_no_division_by_zero() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let view = storage.snapshot_view();
        let hits =
            search_bm25(&view, "docs", "text_content", "anything", Bm25Params::default(), 10)
                .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_delta_removes_pre_image_tokens() {
        let uuid = Uuid::new_v4();
        let delta = compute_delta(
            "docs",
            "text_content",
            uuid,
            Some("old words here"),
            Some("new words"),
        )
        .unwrap();
        // Pre-image postings deleted, post-image postings written.
        assert!(!delta.deletes.is_empty());
        assert!(!delta.puts.is_empty());
        assert_eq!(delta.stats_delta.0, 0); // -1 +1
    }

    #[test]
    fn test_update_reindexes_document() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut stats = FtStats::default();
        let uuid = Uuid::new_v4();
        index_doc(&storage, uuid, "alpha beta", &mut stats);

        // Replace content: alpha disappears, gamma appears.
        let delta =
            compute_delta("docs", "text_content", uuid, Some("alpha beta"), Some("gamma beta"))
                .unwrap();
        for k in &delta.deletes {
            storage.delete(CF_IDX_FT, k).unwrap();
        }
        for (k, v) in &delta.puts {
            storage.put(CF_IDX_FT, k, v).unwrap();
        }
        stats = apply_stats_delta(stats, delta.stats_delta);
        storage
            .put(
                CF_IDX_FT,
                &ft_stats_key("docs", "text_content"),
                &bincode::serialize(&stats).unwrap(),
            )
            .unwrap();

        let view = storage.snapshot_view();
        let alpha =
            search_bm25(&view, "docs", "text_content", "alpha", Bm25Params::default(), 10).unwrap();
        assert!(alpha.is_empty());
        let gamma =
            search_bm25(&view, "docs", "text_content", "gamma", Bm25Params::default(), 10).unwrap();
        assert_eq!(gamma.len(), 1);
        assert_eq!(gamma[0].0, uuid);
    }
}
