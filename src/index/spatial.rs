//! Spatial projection on the Morton Z-order curve.
//!
//! One `idx_spatial` key per entity, placed at the Morton cell of the
//! geometry centroid. A query MBR becomes a bounded set of code ranges
//! (each one KV seek); the union of scanned UUIDs is an over-approximation
//! that the executor rechecks against the exact EWKB geometry.

use crate::geo::morton::{self, MortonRange};
use crate::geo::Mbr;
use crate::storage::descriptor::CollectionDescriptor;
use crate::storage::keys::{decode_index_key_uuid, spatial_bounds, spatial_key};
use crate::storage::{SnapshotView, CF_IDX_SPATIAL, SCAN_BATCH_SIZE};
use crate::types::{Entity, Result, ThemisError};
use std::collections::HashSet;
use uuid::Uuid;

/// Bound on Morton ranges per query; beyond it cells coarsen and the
/// exact recheck absorbs the extra false positives.
pub const MAX_QUERY_RANGES: usize = 64;

/// Staged mutations for the spatial CF.
#[derive(Debug, Default)]
pub struct SpatialDelta {
    pub puts: Vec<Vec<u8>>,
    pub deletes: Vec<Vec<u8>>,
}

/// Compute the spatial delta between two entity images. Fires only when
/// the geo sidecar (derived from `geometry`) actually changed.
pub fn compute_delta(
    collection: &str,
    desc: &CollectionDescriptor,
    uuid: Uuid,
    pre: Option<&Entity>,
    post: Option<&Entity>,
) -> SpatialDelta {
    let mut delta = SpatialDelta::default();
    let Some(config) = &desc.spatial else {
        return delta;
    };

    let pre_cell = pre.and_then(|e| e.geo_sidecar.as_ref()).map(|s| s.centroid);
    let post_cell = post.and_then(|e| e.geo_sidecar.as_ref()).map(|s| s.centroid);
    if pre_cell == post_cell {
        return delta;
    }

    if let Some((x, y)) = pre_cell {
        delta
            .deletes
            .push(spatial_key(collection, &config.field, morton::encode(x, y), uuid));
    }
    if let Some((x, y)) = post_cell {
        delta
            .puts
            .push(spatial_key(collection, &config.field, morton::encode(x, y), uuid));
    }
    delta
}

/// Scan the spatial index for candidates inside a query MBR.
///
/// Rejects antimeridian-crossing MBRs (`InvalidInput`, planar
/// assumption). Results are UUIDs only; exact predicate evaluation
/// happens downstream.
pub fn scan_mbr(
    view: &SnapshotView<'_>,
    collection: &str,
    field: &str,
    mbr: &Mbr,
) -> Result<HashSet<Uuid>> {
    if mbr.crosses_antimeridian() {
        return Err(ThemisError::invalid(
            "query MBR crosses the antimeridian; split the query at ±180°",
        ));
    }

    let ranges: Vec<MortonRange> = morton::mbr_to_ranges(mbr, MAX_QUERY_RANGES);
    let mut out = HashSet::new();
    for range in ranges {
        let (lower, upper) = spatial_bounds(collection, field, range.start, range.end);
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let batch = view.scan_batch(
                CF_IDX_SPATIAL,
                &lower,
                &upper,
                resume.as_deref(),
                SCAN_BATCH_SIZE,
            )?;
            if batch.is_empty() {
                break;
            }
            for (key, _) in &batch {
                out.insert(decode_index_key_uuid(key)?);
            }
            resume = Some(batch.last().unwrap().0.clone());
        }
    }
    Ok(out)
}

/// Selectivity estimate: query area over collection bounding area, times
/// indexed density. Clamped to [0, 1].
pub fn estimate_selectivity(query_mbr: &Mbr, collection_mbr: Option<&Mbr>) -> f64 {
    let Some(cmbr) = collection_mbr else {
        return 0.05;
    };
    let total = cmbr.area();
    if total <= 0.0 {
        return 0.05;
    }
    (query_mbr.area() / total).clamp(0.0, 1.0)
}
