//! Cost-based planning.
//!
//! For each index-compilable conjunct the planner estimates a selectivity
//! in [0, 1]: equality via sampled counts under the value prefix (with a
//! cached approximate count when available), range via endpoint
//! positions, full-text via a cheap document-frequency upper bound,
//! spatial via bbox-area ratio. Vector clauses have no selectivity — a
//! k-producer, not a filter. The executor probes the smallest-selectivity
//! source first and rechecks the rest.

use crate::codec::sortable::sortable_bytes;
use crate::index::fulltext;
use crate::index::secondary::approx_eq_count;
use crate::index::spatial::estimate_selectivity;
use crate::query::plan::{FtClause, Predicate, QueryPlan, SpatialClause};
use crate::storage::keys::{entity_prefix, prefix_upper_bound, range_bounds};
use crate::storage::{SnapshotView, CF_ENTITY, CF_IDX_RANGE};
use crate::types::{FieldValue, Result};

/// Sampling cap for selectivity probes; beyond it the estimate saturates.
const SAMPLE_CAP: usize = 4096;

/// The candidate source the executor should open first.
#[derive(Debug, Clone)]
pub enum SourceChoice {
    /// Equality probe on one conjunct
    EqIndex { field: String, value: FieldValue },
    /// IN-expansion over equality probes
    InIndex { field: String, values: Vec<FieldValue> },
    /// Range probe
    RangeIndex { field: String, lo: Option<FieldValue>, lo_inclusive: bool, hi: Option<FieldValue>, hi_inclusive: bool },
    /// BM25 source
    FullText(FtClause),
    /// Morton index source
    Spatial(SpatialClause),
    /// Nothing usable: ordered scan of the collection
    SeqScan,
}

/// A source choice with its estimated selectivity.
#[derive(Debug, Clone)]
pub struct ScoredSource {
    pub source: SourceChoice,
    pub selectivity: f64,
}

/// Estimate the collection's entity count (sampled, capped).
pub fn estimate_collection_size(view: &SnapshotView<'_>, collection: &str) -> Result<usize> {
    let prefix = entity_prefix(collection);
    view.count_prefix(CF_ENTITY, &prefix, SAMPLE_CAP)
}

/// Rank every candidate-producing clause of a plan and return them
/// cheapest-first. The executor intersects/filters the rest.
pub fn rank_sources(view: &SnapshotView<'_>, plan: &QueryPlan) -> Result<Vec<ScoredSource>> {
    let total = estimate_collection_size(view, &plan.collection)?.max(1);
    let mut scored: Vec<ScoredSource> = Vec::new();

    if let Some(predicate) = &plan.predicate {
        for conjunct in predicate.conjuncts() {
            if let Some(choice) = compile_conjunct(conjunct) {
                let selectivity = estimate_source(view, &plan.collection, &choice, total)?;
                scored.push(ScoredSource { source: choice, selectivity });
            }
        }
    }
    if let Some(ft) = &plan.fulltext {
        let selectivity = estimate_fulltext(view, &plan.collection, ft, total)?;
        scored.push(ScoredSource { source: SourceChoice::FullText(ft.clone()), selectivity });
    }
    if let Some(spatial) = &plan.spatial {
        let selectivity = estimate_spatial(view, &plan.collection, spatial)?;
        scored.push(ScoredSource { source: SourceChoice::Spatial(spatial.clone()), selectivity });
    }

    if scored.is_empty() {
        scored.push(ScoredSource { source: SourceChoice::SeqScan, selectivity: 1.0 });
    }
    scored.sort_by(|a, b| {
        a.selectivity
            .partial_cmp(&b.selectivity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(scored)
}

/// Compile one conjunct to an index probe, when possible.
pub fn compile_conjunct(conjunct: &Predicate) -> Option<SourceChoice> {
    match conjunct {
        Predicate::Eq(field, value) => Some(SourceChoice::EqIndex {
            field: field.clone(),
            value: value.clone(),
        }),
        Predicate::In(field, values) => Some(SourceChoice::InIndex {
            field: field.clone(),
            values: values.clone(),
        }),
        Predicate::Gt(field, value) => Some(SourceChoice::RangeIndex {
            field: field.clone(),
            lo: Some(value.clone()),
            lo_inclusive: false,
            hi: None,
            hi_inclusive: false,
        }),
        Predicate::Gte(field, value) => Some(SourceChoice::RangeIndex {
            field: field.clone(),
            lo: Some(value.clone()),
            lo_inclusive: true,
            hi: None,
            hi_inclusive: false,
        }),
        Predicate::Lt(field, value) => Some(SourceChoice::RangeIndex {
            field: field.clone(),
            lo: None,
            lo_inclusive: false,
            hi: Some(value.clone()),
            hi_inclusive: false,
        }),
        Predicate::Lte(field, value) => Some(SourceChoice::RangeIndex {
            field: field.clone(),
            lo: None,
            lo_inclusive: false,
            hi: Some(value.clone()),
            hi_inclusive: true,
        }),
        _ => None,
    }
}

fn estimate_source(
    view: &SnapshotView<'_>,
    collection: &str,
    choice: &SourceChoice,
    total: usize,
) -> Result<f64> {
    match choice {
        SourceChoice::EqIndex { field, value } => {
            let count = approx_eq_count(view, collection, field, value, SAMPLE_CAP)?;
            Ok(count as f64 / total as f64)
        }
        SourceChoice::InIndex { field, values } => {
            let mut count = 0usize;
            for value in values {
                count += approx_eq_count(view, collection, field, value, SAMPLE_CAP)?;
                if count >= SAMPLE_CAP {
                    break;
                }
            }
            Ok((count as f64 / total as f64).min(1.0))
        }
        SourceChoice::RangeIndex { field, lo, hi, .. } => {
            // Endpoint positions: sample the number of keys inside the
            // bounds, capped.
            let lo_bytes = lo.as_ref().and_then(sortable_bytes);
            let hi_bytes = hi.as_ref().and_then(sortable_bytes);
            let (lower, upper) =
                range_bounds(collection, field, lo_bytes.as_deref(), hi_bytes.as_deref());
            let mut count = 0usize;
            let mut resume: Option<Vec<u8>> = None;
            loop {
                let batch = view.scan_batch(
                    CF_IDX_RANGE,
                    &lower,
                    &upper,
                    resume.as_deref(),
                    (SAMPLE_CAP - count).min(1024),
                )?;
                if batch.is_empty() {
                    break;
                }
                count += batch.len();
                if count >= SAMPLE_CAP {
                    break;
                }
                resume = Some(batch.last().unwrap().0.clone());
            }
            Ok((count as f64 / total as f64).min(1.0))
        }
        SourceChoice::FullText(_) | SourceChoice::Spatial(_) | SourceChoice::SeqScan => Ok(1.0),
    }
}

fn estimate_fulltext(
    view: &SnapshotView<'_>,
    collection: &str,
    ft: &FtClause,
    total: usize,
) -> Result<f64> {
    // Upper bound: the rarest term's document frequency.
    let mut best = 1.0f64;
    for token in fulltext::analyze(&ft.query) {
        let df = fulltext::term_doc_frequency(view, collection, &ft.field, &token, SAMPLE_CAP)?;
        best = best.min(df as f64 / total as f64);
    }
    Ok(best.min(1.0))
}

fn estimate_spatial(
    view: &SnapshotView<'_>,
    collection: &str,
    spatial: &SpatialClause,
) -> Result<f64> {
    // Collection bbox is not tracked; the area ratio against the world
    // grid keeps relative ordering between competing spatial clauses.
    let _ = (view, collection);
    let query_mbr = spatial.predicate.query_mbr();
    let world = crate::geo::Mbr::new(-180.0, -90.0, 180.0, 90.0);
    Ok(estimate_selectivity(&query_mbr, Some(&world)).max(1e-6))
}

/// Upper bound (exclusive) helper re-exported for the executor's seq
/// scan.
pub fn collection_bounds(collection: &str) -> (Vec<u8>, Vec<u8>) {
    let prefix = entity_prefix(collection);
    let upper = prefix_upper_bound(&prefix);
    (prefix, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys::index_key;
    use crate::storage::{Storage, CF_IDX_EQ};
    use crate::types::Entity;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn seed(storage: &Storage, n_art: usize, n_tech: usize) {
        use crate::codec::sortable::equality_bytes;
        for (count, value) in [(n_art, "art"), (n_tech, "tech")] {
            let bytes = equality_bytes(&FieldValue::Text(value.into())).unwrap();
            for _ in 0..count {
                let key = index_key("docs", "category", &bytes, Uuid::new_v4());
                storage.put(CF_IDX_EQ, &key, b"").unwrap();
            }
        }
        // Entities: just enough keys for the size estimate.
        let mut table = crate::codec::FieldTable::new();
        for _ in 0..(n_art + n_tech) {
            let e = Entity::from_json(&json!({"x": 1})).unwrap();
            let blob = crate::codec::encode(&e, &mut table).unwrap();
            storage
                .put(
                    CF_ENTITY,
                    &crate::storage::keys::entity_key("docs", Uuid::new_v4()),
                    &blob,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_rare_value_ranks_first() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        seed(&storage, 5, 95);

        let view = storage.snapshot_view();
        let plan = QueryPlan::scan("docs").with_predicate(Predicate::And(vec![
            Predicate::Eq("category".into(), FieldValue::Text("tech".into())),
            Predicate::Eq("category".into(), FieldValue::Text("art".into())),
        ]));
        let ranked = rank_sources(&view, &plan).unwrap();
        assert_eq!(ranked.len(), 2);
        match &ranked[0].source {
            SourceChoice::EqIndex { value, .. } => {
                assert_eq!(value, &FieldValue::Text("art".into()));
            }
            other => panic!("expected eq index first, got {other:?}"),
        }
        assert!(ranked[0].selectivity < ranked[1].selectivity);
    }

    #[test]
    fn test_no_clauses_falls_back_to_seq_scan() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let view = storage.snapshot_view();
        let ranked = rank_sources(&view, &QueryPlan::scan("docs")).unwrap();
        assert_eq!(ranked.len(), 1);
        assert!(matches!(ranked[0].source, SourceChoice::SeqScan));
    }

    #[test]
    fn test_compile_range_conjunct() {
        let choice =
            compile_conjunct(&Predicate::Gte("age".into(), FieldValue::Int(18))).unwrap();
        match choice {
            SourceChoice::RangeIndex { lo, lo_inclusive, hi, .. } => {
                assert_eq!(lo, Some(FieldValue::Int(18)));
                assert!(lo_inclusive);
                assert!(hi.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_compilable_conjuncts_skipped() {
        assert!(compile_conjunct(&Predicate::Contains("t".into(), "x".into())).is_none());
        assert!(compile_conjunct(&Predicate::Exists("t".into())).is_none());
    }
}
