//! Query executor.
//!
//! Runs plans as compositions of candidate-producing primitives
//! (seq/eq/range/ft/spatial/vector scans) and combinators (intersect,
//! filter, load, topK). Candidate sources are finite lazy sequences with
//! a declared ordering; the executor pulls them in batches and checks
//! the deadline between batches, not per element.
//!
//! The hybrid pipelines live here: filtered vector search (whitelist vs
//! post-filter switch), vector+geo, content+geo. Graph+geo runs through
//! `graph::Traverser` with the same snapshot.

use crate::codec;
use crate::config::QueryLimits;
use crate::geo::algorithms::min_distance;
use crate::geo::Geometry;
use crate::index::fulltext::{self, Bm25Params};
use crate::index::spatial;
use crate::index::vector::VectorIndexRegistry;
use crate::query::plan::{Predicate, QueryPlan, SpatialClause, VectorClause};
use crate::query::planner::{self, SourceChoice};
use crate::storage::keys::{
    decode_entity_key, decode_index_key_uuid, entity_key, index_value_prefix, prefix_upper_bound,
    range_bounds,
};
use crate::storage::{
    CollectionDescriptor, DescriptorCache, SnapshotView, CF_ENTITY, CF_IDX_EQ, CF_IDX_RANGE,
    SCAN_BATCH_SIZE,
};
use crate::types::{fields, Entity, FieldValue, Result, ThemisError};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// One candidate produced by a primitive.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub uuid: Uuid,
    pub score: Option<f32>,
    pub distance: Option<f32>,
}

/// Declared ordering of a candidate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrdering {
    ByUuid,
    ByValueThenUuid,
    ByScoreDesc,
    ByDistanceAsc,
    Unordered,
}

/// A finite lazy candidate sequence. An empty batch means exhaustion.
pub trait CandidateStream {
    fn ordering(&self) -> StreamOrdering;
    fn next_batch(&mut self, max: usize) -> Result<Vec<Candidate>>;
}

/// Key-range scan stream over an index CF, yielding the uuid tail of
/// each key.
struct KeyScanStream<'a> {
    view: &'a SnapshotView<'a>,
    cf: &'static str,
    lower: Vec<u8>,
    upper: Vec<u8>,
    resume: Option<Vec<u8>>,
    done: bool,
    ordering: StreamOrdering,
}

impl<'a> KeyScanStream<'a> {
    fn new(
        view: &'a SnapshotView<'a>,
        cf: &'static str,
        lower: Vec<u8>,
        upper: Vec<u8>,
        ordering: StreamOrdering,
    ) -> Self {
        Self { view, cf, lower, upper, resume: None, done: false, ordering }
    }
}

impl CandidateStream for KeyScanStream<'_> {
    fn ordering(&self) -> StreamOrdering {
        self.ordering
    }

    fn next_batch(&mut self, max: usize) -> Result<Vec<Candidate>> {
        if self.done {
            return Ok(Vec::new());
        }
        let batch = self.view.scan_batch(
            self.cf,
            &self.lower,
            &self.upper,
            self.resume.as_deref(),
            max.min(SCAN_BATCH_SIZE),
        )?;
        if batch.is_empty() {
            self.done = true;
            return Ok(Vec::new());
        }
        self.resume = Some(batch.last().unwrap().0.clone());
        batch
            .iter()
            .map(|(key, _)| {
                Ok(Candidate {
                    uuid: decode_index_key_uuid(key)?,
                    score: None,
                    distance: None,
                })
            })
            .collect()
    }
}

/// Ordered scan of the primary CF itself.
struct SeqScanStream<'a> {
    inner: KeyScanStream<'a>,
}

impl CandidateStream for SeqScanStream<'_> {
    fn ordering(&self) -> StreamOrdering {
        StreamOrdering::ByUuid
    }

    fn next_batch(&mut self, max: usize) -> Result<Vec<Candidate>> {
        if self.inner.done {
            return Ok(Vec::new());
        }
        let batch = self.inner.view.scan_batch(
            self.inner.cf,
            &self.inner.lower,
            &self.inner.upper,
            self.inner.resume.as_deref(),
            max.min(SCAN_BATCH_SIZE),
        )?;
        if batch.is_empty() {
            self.inner.done = true;
            return Ok(Vec::new());
        }
        self.inner.resume = Some(batch.last().unwrap().0.clone());
        batch
            .iter()
            .map(|(key, _)| {
                let (_, uuid) = decode_entity_key(key)?;
                Ok(Candidate { uuid, score: None, distance: None })
            })
            .collect()
    }
}

/// Pre-computed candidates replayed in batches (ft/vector/spatial).
struct VecStream {
    items: std::vec::IntoIter<Candidate>,
    ordering: StreamOrdering,
}

impl VecStream {
    fn new(items: Vec<Candidate>, ordering: StreamOrdering) -> Self {
        Self { items: items.into_iter(), ordering }
    }
}

impl CandidateStream for VecStream {
    fn ordering(&self) -> StreamOrdering {
        self.ordering
    }

    fn next_batch(&mut self, max: usize) -> Result<Vec<Candidate>> {
        Ok(self.items.by_ref().take(max).collect())
    }
}

/// One materialized result row.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub uuid: Uuid,
    pub entity: Option<Entity>,
    pub score: Option<f32>,
    pub distance: Option<f32>,
}

/// Executor bound to one snapshot and one deadline.
pub struct Executor<'a> {
    view: &'a SnapshotView<'a>,
    descriptors: &'a DescriptorCache,
    vectors: &'a VectorIndexRegistry,
    bm25: Bm25Params,
    limits: QueryLimits,
    deadline: Instant,
}

impl<'a> Executor<'a> {
    pub fn new(
        view: &'a SnapshotView<'a>,
        descriptors: &'a DescriptorCache,
        vectors: &'a VectorIndexRegistry,
        bm25: Bm25Params,
        limits: QueryLimits,
        deadline: Instant,
    ) -> Self {
        Self { view, descriptors, vectors, bm25, limits, deadline }
    }

    fn check_deadline(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(ThemisError::Timeout);
        }
        Ok(())
    }

    /// Run a plan to completion.
    pub fn execute(&self, plan: &QueryPlan) -> Result<Vec<ResultRow>> {
        let desc = self.descriptors.load(&plan.collection)?;

        if let Some(vector) = &plan.vector {
            let rows = if plan.spatial.is_some() {
                self.vector_geo(plan, vector, &desc)?
            } else {
                self.filtered_vector(plan, vector, &desc)?
            };
            return Ok(paginate(rows, plan.limit, plan.offset));
        }
        if plan.fulltext.is_some() && plan.spatial.is_some() {
            let rows = self.content_geo(plan, &desc)?;
            return Ok(paginate(rows, plan.limit, plan.offset));
        }
        if let Some(ft) = &plan.fulltext {
            let cap = fetch_cap(plan);
            let hits = fulltext::search_bm25(
                self.view,
                &plan.collection,
                &ft.field,
                &ft.query,
                self.bm25,
                cap,
            )?;
            let rows = self.load_and_filter(
                &plan.collection,
                &desc,
                hits.into_iter()
                    .map(|(uuid, score)| Candidate { uuid, score: Some(score), distance: None })
                    .collect(),
                plan.predicate.as_ref(),
                plan.spatial.as_ref(),
            )?;
            return Ok(paginate(rows, plan.limit, plan.offset));
        }
        if let Some(spatial_clause) = &plan.spatial {
            let rows = self.spatial_candidates(plan, spatial_clause, &desc)?;
            let rows = self.order_rows(rows, plan)?;
            return Ok(paginate(rows, plan.limit, plan.offset));
        }

        // Structured-only: cheapest source first, recheck the rest.
        self.structured(plan, &desc)
    }

    /// Structured path with early stop when no ORDER BY is requested.
    fn structured(&self, plan: &QueryPlan, desc: &CollectionDescriptor) -> Result<Vec<ResultRow>> {
        let ranked = planner::rank_sources(self.view, plan)?;
        let mut stream = self.open_source(&ranked[0].source, &plan.collection)?;

        let want = plan
            .limit
            .map(|l| l.saturating_add(plan.offset))
            .unwrap_or(usize::MAX);
        let early_stop = plan.order_by.is_none();

        let mut rows: Vec<ResultRow> = Vec::new();
        loop {
            self.check_deadline()?;
            let batch = stream.next_batch(SCAN_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            let filtered =
                self.load_and_filter(&plan.collection, desc, batch, plan.predicate.as_ref(), None)?;
            rows.extend(filtered);
            if early_stop && rows.len() >= want {
                rows.truncate(want);
                break;
            }
        }

        let rows = self.order_rows(rows, plan)?;
        Ok(paginate(rows, plan.limit, plan.offset))
    }

    /// Open a primitive chosen by the planner.
    fn open_source(
        &self,
        choice: &SourceChoice,
        collection: &str,
    ) -> Result<Box<dyn CandidateStream + 'a>> {
        match choice {
            SourceChoice::SeqScan => {
                let (lower, upper) = planner::collection_bounds(collection);
                Ok(Box::new(SeqScanStream {
                    inner: KeyScanStream::new(
                        self.view,
                        CF_ENTITY,
                        lower,
                        upper,
                        StreamOrdering::ByUuid,
                    ),
                }))
            }
            SourceChoice::EqIndex { field, value } => {
                let bytes = crate::codec::sortable::equality_bytes(value)
                    .ok_or_else(|| ThemisError::invalid("value not equality-indexable"))?;
                let lower = index_value_prefix(collection, field, &bytes);
                let upper = prefix_upper_bound(&lower);
                Ok(Box::new(KeyScanStream::new(
                    self.view,
                    CF_IDX_EQ,
                    lower,
                    upper,
                    StreamOrdering::ByUuid,
                )))
            }
            SourceChoice::InIndex { field, values } => {
                // IN expands to a union of equality probes, deduplicated.
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for value in values {
                    let Some(bytes) = crate::codec::sortable::equality_bytes(value) else {
                        continue;
                    };
                    let lower = index_value_prefix(collection, field, &bytes);
                    let upper = prefix_upper_bound(&lower);
                    let mut stream = KeyScanStream::new(
                        self.view,
                        CF_IDX_EQ,
                        lower,
                        upper,
                        StreamOrdering::ByUuid,
                    );
                    loop {
                        self.check_deadline()?;
                        let batch = stream.next_batch(SCAN_BATCH_SIZE)?;
                        if batch.is_empty() {
                            break;
                        }
                        for c in batch {
                            if seen.insert(c.uuid) {
                                out.push(c);
                            }
                        }
                    }
                }
                Ok(Box::new(VecStream::new(out, StreamOrdering::Unordered)))
            }
            SourceChoice::RangeIndex { field, lo, hi, .. } => {
                // Inclusive byte bounds; exact exclusivity is restored by
                // the predicate recheck on loaded entities.
                let lo_bytes = lo.as_ref().and_then(crate::codec::sortable::sortable_bytes);
                let hi_bytes = hi.as_ref().and_then(crate::codec::sortable::sortable_bytes);
                let (lower, upper) =
                    range_bounds(collection, field, lo_bytes.as_deref(), hi_bytes.as_deref());
                Ok(Box::new(KeyScanStream::new(
                    self.view,
                    CF_IDX_RANGE,
                    lower,
                    upper,
                    StreamOrdering::ByValueThenUuid,
                )))
            }
            SourceChoice::FullText(ft) => {
                let hits = fulltext::search_bm25(
                    self.view,
                    collection,
                    &ft.field,
                    &ft.query,
                    self.bm25,
                    self.limits.max_candidates,
                )?;
                Ok(Box::new(VecStream::new(
                    hits.into_iter()
                        .map(|(uuid, score)| Candidate { uuid, score: Some(score), distance: None })
                        .collect(),
                    StreamOrdering::ByScoreDesc,
                )))
            }
            SourceChoice::Spatial(clause) => {
                let mbr = clause.predicate.query_mbr();
                let uuids = spatial::scan_mbr(self.view, collection, &clause.field, &mbr)?;
                Ok(Box::new(VecStream::new(
                    uuids
                        .into_iter()
                        .map(|uuid| Candidate { uuid, score: None, distance: None })
                        .collect(),
                    StreamOrdering::Unordered,
                )))
            }
        }
    }

    /// Load candidates (multi-get) and recheck the real predicate and
    /// exact spatial geometry. Local recheck failures are filtered
    /// silently — never errors.
    fn load_and_filter(
        &self,
        collection: &str,
        desc: &CollectionDescriptor,
        candidates: Vec<Candidate>,
        predicate: Option<&Predicate>,
        spatial_clause: Option<&SpatialClause>,
    ) -> Result<Vec<ResultRow>> {
        let mut rows = Vec::with_capacity(candidates.len());
        for chunk in candidates.chunks(SCAN_BATCH_SIZE) {
            self.check_deadline()?;
            let keys: Vec<Vec<u8>> = chunk
                .iter()
                .map(|c| entity_key(collection, c.uuid))
                .collect();
            let blobs = self.view.multi_get(CF_ENTITY, &keys)?;
            for (candidate, blob) in chunk.iter().zip(blobs) {
                let Some(blob) = blob else {
                    continue;
                };
                let entity = codec::decode(&blob, &desc.fields)?;
                if let Some(pred) = predicate {
                    if !pred.evaluate(&entity) {
                        continue;
                    }
                }
                if let Some(clause) = spatial_clause {
                    if !spatial_matches(&entity, clause)? {
                        continue;
                    }
                }
                rows.push(ResultRow {
                    uuid: candidate.uuid,
                    entity: Some(entity),
                    score: candidate.score,
                    distance: candidate.distance,
                });
            }
        }
        Ok(rows)
    }

    /// Sort rows by the plan's ORDER BY, or keep source order.
    fn order_rows(&self, mut rows: Vec<ResultRow>, plan: &QueryPlan) -> Result<Vec<ResultRow>> {
        if let Some(order) = &plan.order_by {
            rows.sort_by(|a, b| {
                let va = a.entity.as_ref().and_then(|e| e.get(&order.field));
                let vb = b.entity.as_ref().and_then(|e| e.get(&order.field));
                let cmp = compare_values(va, vb).then_with(|| a.uuid.cmp(&b.uuid));
                if order.descending {
                    cmp.reverse()
                } else {
                    cmp
                }
            });
        }
        Ok(rows)
    }

    // --- hybrid pipelines ---

    /// Filtered vector search.
    ///
    /// Compilable predicates become a whitelist via index intersection;
    /// when the whitelist would exceed `max_filter_scan_size`, switch to
    /// post-filter: fetch α·k from the HNSW, recheck, grow and retry.
    fn filtered_vector(
        &self,
        plan: &QueryPlan,
        vector: &VectorClause,
        desc: &CollectionDescriptor,
    ) -> Result<Vec<ResultRow>> {
        self.validate_vector(&plan.collection, vector, desc)?;

        let Some(predicate) = &plan.predicate else {
            let hits = self.vectors.search(
                &plan.collection,
                &vector.field,
                &vector.query,
                vector.k,
                vector.ef_search,
                None,
            )?;
            return self.load_and_filter(
                &plan.collection,
                desc,
                hits.into_iter()
                    .map(|(uuid, d)| Candidate { uuid, score: None, distance: Some(d) })
                    .collect(),
                None,
                None,
            );
        };

        match self.compile_whitelist(&plan.collection, predicate)? {
            Some(whitelist) => {
                let hits = self.vectors.search(
                    &plan.collection,
                    &vector.field,
                    &vector.query,
                    vector.k,
                    vector.ef_search,
                    Some(&whitelist),
                )?;
                // Residual (non-compilable) conjuncts recheck on load.
                self.load_and_filter(
                    &plan.collection,
                    desc,
                    hits.into_iter()
                        .map(|(uuid, d)| Candidate { uuid, score: None, distance: Some(d) })
                        .collect(),
                    Some(predicate),
                    None,
                )
            }
            None => self.post_filter_vector(plan, vector, desc, predicate),
        }
    }

    /// Post-filter path: α·k over-fetch with bounded growth.
    fn post_filter_vector(
        &self,
        plan: &QueryPlan,
        vector: &VectorClause,
        desc: &CollectionDescriptor,
        predicate: &Predicate,
    ) -> Result<Vec<ResultRow>> {
        let mut fetch_k =
            ((vector.k as f32) * self.limits.whitelist_growth_factor).ceil() as usize;
        let mut last_rows: Vec<ResultRow> = Vec::new();
        for _attempt in 0..self.limits.whitelist_max_attempts {
            self.check_deadline()?;
            let hits = self.vectors.search(
                &plan.collection,
                &vector.field,
                &vector.query,
                fetch_k,
                vector.ef_search.map(|ef| ef.max(fetch_k)),
                None,
            )?;
            let exhausted = hits.len() < fetch_k;
            let mut rows = self.load_and_filter(
                &plan.collection,
                desc,
                hits.into_iter()
                    .map(|(uuid, d)| Candidate { uuid, score: None, distance: Some(d) })
                    .collect(),
                Some(predicate),
                None,
            )?;
            if rows.len() >= vector.k || exhausted {
                rows.truncate(vector.k);
                return Ok(rows);
            }
            last_rows = rows;
            fetch_k = ((fetch_k as f32) * self.limits.whitelist_growth_factor).ceil() as usize;
        }
        // Retry budget exhausted: whatever passed, ordered by distance.
        last_rows.truncate(vector.k);
        Ok(last_rows)
    }

    /// Build the whitelist by intersecting equality/range probes.
    /// `None` means the whitelist would exceed the scan budget.
    fn compile_whitelist(
        &self,
        collection: &str,
        predicate: &Predicate,
    ) -> Result<Option<HashSet<Uuid>>> {
        let mut whitelist: Option<HashSet<Uuid>> = None;
        for conjunct in predicate.conjuncts() {
            let Some(choice) = planner::compile_conjunct(conjunct) else {
                continue;
            };
            let mut stream = self.open_source(&choice, collection)?;
            let mut set = HashSet::new();
            loop {
                self.check_deadline()?;
                let batch = stream.next_batch(SCAN_BATCH_SIZE)?;
                if batch.is_empty() {
                    break;
                }
                for c in batch {
                    set.insert(c.uuid);
                }
                if set.len() > self.limits.max_filter_scan_size {
                    return Ok(None);
                }
            }
            whitelist = Some(match whitelist {
                None => set,
                Some(current) => current.intersection(&set).copied().collect(),
            });
            if whitelist.as_ref().is_some_and(|w| w.is_empty()) {
                break;
            }
        }
        Ok(whitelist)
    }

    /// Vector + geo: spatial candidates → exact EWKB recheck → k-NN
    /// restricted to the survivors. Ordered by distance ascending.
    fn vector_geo(
        &self,
        plan: &QueryPlan,
        vector: &VectorClause,
        desc: &CollectionDescriptor,
    ) -> Result<Vec<ResultRow>> {
        self.validate_vector(&plan.collection, vector, desc)?;
        let clause = plan.spatial.as_ref().expect("vector_geo requires spatial");

        let stage1: Vec<Candidate> = if desc.spatial.is_some() {
            let mbr = clause.predicate.query_mbr();
            spatial::scan_mbr(self.view, &plan.collection, &clause.field, &mbr)?
                .into_iter()
                .map(|uuid| Candidate { uuid, score: None, distance: None })
                .collect()
        } else {
            warn!(
                collection = %plan.collection,
                "no spatial index configured; falling back to sequential scan with exact filter"
            );
            let (lower, upper) = planner::collection_bounds(&plan.collection);
            let mut stream = SeqScanStream {
                inner: KeyScanStream::new(
                    self.view,
                    CF_ENTITY,
                    lower,
                    upper,
                    StreamOrdering::ByUuid,
                ),
            };
            let mut all = Vec::new();
            loop {
                self.check_deadline()?;
                let batch = stream.next_batch(SCAN_BATCH_SIZE)?;
                if batch.is_empty() {
                    break;
                }
                all.extend(batch);
            }
            all
        };

        // Stage 2: exact recheck builds the whitelist.
        let stage2 =
            self.load_and_filter(&plan.collection, desc, stage1, plan.predicate.as_ref(), Some(clause))?;
        let whitelist: HashSet<Uuid> = stage2.iter().map(|r| r.uuid).collect();

        // Stage 3: k-NN over the whitelist.
        let hits = self.vectors.search(
            &plan.collection,
            &vector.field,
            &vector.query,
            vector.k,
            vector.ef_search,
            Some(&whitelist),
        )?;
        let mut by_uuid: HashMap<Uuid, ResultRow> =
            stage2.into_iter().map(|r| (r.uuid, r)).collect();
        Ok(hits
            .into_iter()
            .filter_map(|(uuid, d)| {
                by_uuid.remove(&uuid).map(|mut row| {
                    row.distance = Some(d);
                    row
                })
            })
            .collect())
    }

    /// Content + geo: BM25 first (typically very selective), spatial
    /// filter on the loaded docs, optional blended re-rank.
    fn content_geo(&self, plan: &QueryPlan, desc: &CollectionDescriptor) -> Result<Vec<ResultRow>> {
        let ft = plan.fulltext.as_ref().expect("content_geo requires fulltext");
        let clause = plan.spatial.as_ref().expect("content_geo requires spatial");

        let cap = fetch_cap(plan).max(self.limits.max_candidates.min(10_000));
        let hits = fulltext::search_bm25(
            self.view,
            &plan.collection,
            &ft.field,
            &ft.query,
            self.bm25,
            cap,
        )?;
        let mut rows = self.load_and_filter(
            &plan.collection,
            desc,
            hits.into_iter()
                .map(|(uuid, score)| Candidate { uuid, score: Some(score), distance: None })
                .collect(),
            plan.predicate.as_ref(),
            Some(clause),
        )?;

        if let Some(alpha) = plan.rerank_alpha {
            let query_geom = clause_geometry(clause);
            for row in &mut rows {
                let doc_distance = row
                    .entity
                    .as_ref()
                    .and_then(|e| e.geometry().ok().flatten())
                    .map(|g| min_distance(&g, query_geom) as f32)
                    .unwrap_or(f32::MAX);
                row.distance = Some(doc_distance);
                let bm25 = row.score.unwrap_or(0.0);
                row.score = Some(alpha * bm25 + (1.0 - alpha) * (1.0 / (1.0 + doc_distance)));
            }
            rows.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| a.uuid.cmp(&b.uuid))
            });
        }
        Ok(rows)
    }

    /// Spatial-only candidates with exact recheck.
    fn spatial_candidates(
        &self,
        plan: &QueryPlan,
        clause: &SpatialClause,
        desc: &CollectionDescriptor,
    ) -> Result<Vec<ResultRow>> {
        let mbr = clause.predicate.query_mbr();
        let uuids = spatial::scan_mbr(self.view, &plan.collection, &clause.field, &mbr)?;
        self.load_and_filter(
            &plan.collection,
            desc,
            uuids
                .into_iter()
                .map(|uuid| Candidate { uuid, score: None, distance: None })
                .collect(),
            plan.predicate.as_ref(),
            Some(clause),
        )
    }

    fn validate_vector(
        &self,
        collection: &str,
        vector: &VectorClause,
        desc: &CollectionDescriptor,
    ) -> Result<()> {
        let expected = desc
            .vector
            .as_ref()
            .map(|v| v.dim)
            .or_else(|| self.vectors.dimension(collection, &vector.field));
        if let Some(expected) = expected {
            if vector.query.len() != expected {
                return Err(ThemisError::DimensionMismatch {
                    expected,
                    actual: vector.query.len(),
                });
            }
        }
        Ok(())
    }
}

/// Exact spatial check against the entity's geometry field.
fn spatial_matches(entity: &Entity, clause: &SpatialClause) -> Result<bool> {
    let field = if clause.field == fields::GEOMETRY {
        entity.geometry()?
    } else {
        match entity.get(&clause.field) {
            Some(FieldValue::Bytes(b)) => Some(Geometry::parse_ewkb(b)?),
            _ => None,
        }
    };
    Ok(field
        .map(|geom| clause.predicate.matches(&geom))
        .unwrap_or(false))
}

fn clause_geometry(clause: &SpatialClause) -> &Geometry {
    match &clause.predicate {
        crate::geo::SpatialPredicate::Intersects(g)
        | crate::geo::SpatialPredicate::Within(g)
        | crate::geo::SpatialPredicate::Contains(g)
        | crate::geo::SpatialPredicate::DWithin { geometry: g, .. } => g,
    }
}

fn compare_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> CmpOrdering {
    match (a, b) {
        (Some(FieldValue::Int(x)), Some(FieldValue::Int(y))) => x.cmp(y),
        (Some(FieldValue::Float(x)), Some(FieldValue::Float(y))) => {
            x.partial_cmp(y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(FieldValue::Int(x)), Some(FieldValue::Float(y))) => {
            (*x as f64).partial_cmp(y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(FieldValue::Float(x)), Some(FieldValue::Int(y))) => {
            x.partial_cmp(&(*y as f64)).unwrap_or(CmpOrdering::Equal)
        }
        (Some(FieldValue::Text(x)), Some(FieldValue::Text(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

fn fetch_cap(plan: &QueryPlan) -> usize {
    plan.limit
        .map(|l| (l + plan.offset).saturating_mul(4).max(256))
        .unwrap_or(10_000)
}

fn paginate(rows: Vec<ResultRow>, limit: Option<usize>, offset: usize) -> Vec<ResultRow> {
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
