//! Secondary equality and range projections.
//!
//! Both live in their own CFs keyed by
//! `{collection}:{field}:{value}:{uuid}`; the range CF uses the
//! order-preserving value encoding so a seek walks values in order.
//! Deltas are computed for exactly the fields that changed between the
//! pre- and post-image.

use crate::codec::sortable::{equality_bytes, sortable_bytes};
use crate::storage::descriptor::CollectionDescriptor;
use crate::storage::keys::{count_key, index_key, index_value_prefix};
use crate::storage::{SnapshotView, CF_IDX_EQ, CF_META};
use crate::types::{Entity, FieldValue, Result};
use uuid::Uuid;

/// Staged mutations for the eq and range CFs.
#[derive(Debug, Default)]
pub struct SecondaryDelta {
    pub eq_puts: Vec<Vec<u8>>,
    pub eq_deletes: Vec<Vec<u8>>,
    pub range_puts: Vec<Vec<u8>>,
    pub range_deletes: Vec<Vec<u8>>,
}

impl SecondaryDelta {
    pub fn is_empty(&self) -> bool {
        self.eq_puts.is_empty()
            && self.eq_deletes.is_empty()
            && self.range_puts.is_empty()
            && self.range_deletes.is_empty()
    }
}

/// Compute eq/range deltas between two entity images.
///
/// Unchanged fields produce nothing; that property is what keeps write
/// amplification proportional to the change, not to the entity.
pub fn compute_delta(
    collection: &str,
    desc: &CollectionDescriptor,
    uuid: Uuid,
    pre: Option<&Entity>,
    post: Option<&Entity>,
) -> SecondaryDelta {
    let mut delta = SecondaryDelta::default();

    let empty = std::collections::BTreeMap::new();
    let pre_fields = pre.map(|e| &e.fields).unwrap_or(&empty);
    let post_fields = post.map(|e| &e.fields).unwrap_or(&empty);

    let mut names: std::collections::BTreeSet<&String> = pre_fields.keys().collect();
    names.extend(post_fields.keys());

    for name in names {
        let before = pre_fields.get(name.as_str());
        let after = post_fields.get(name.as_str());
        if before == after {
            continue;
        }
        if let Some(value) = before {
            stage(&mut delta, collection, desc, name, value, uuid, false);
        }
        if let Some(value) = after {
            stage(&mut delta, collection, desc, name, value, uuid, true);
        }
    }
    delta
}

fn stage(
    delta: &mut SecondaryDelta,
    collection: &str,
    desc: &CollectionDescriptor,
    field: &str,
    value: &FieldValue,
    uuid: Uuid,
    is_put: bool,
) {
    if desc.eq_indexes_field(field) {
        if let Some(bytes) = equality_bytes(value) {
            let key = index_key(collection, field, &bytes, uuid);
            if is_put {
                delta.eq_puts.push(key);
            } else {
                delta.eq_deletes.push(key);
            }
        }
    }
    if desc.range_indexes_field(field) {
        if let Some(bytes) = sortable_bytes(value) {
            let key = index_key(collection, field, &bytes, uuid);
            if is_put {
                delta.range_puts.push(key);
            } else {
                delta.range_deletes.push(key);
            }
        }
    }
}

/// Sampled count of entities with `field == value`, capped at `cap`.
///
/// A cached approximate count under `meta` short-circuits the sample when
/// present; the caller refreshes the cache opportunistically.
pub fn approx_eq_count(
    view: &SnapshotView<'_>,
    collection: &str,
    field: &str,
    value: &FieldValue,
    cap: usize,
) -> Result<usize> {
    let Some(bytes) = equality_bytes(value) else {
        return Ok(0);
    };
    if let Some(cached) = view.get(CF_META, &count_key(collection, field, &bytes))? {
        if let Ok(arr) = <[u8; 8]>::try_from(cached.as_slice()) {
            return Ok(u64::from_le_bytes(arr) as usize);
        }
    }
    let prefix = index_value_prefix(collection, field, &bytes);
    view.count_prefix(CF_IDX_EQ, &prefix, cap)
}

/// Serialized form of a cached count, written outside transactions by
/// the planner's sampler.
pub fn count_cache_entry(
    collection: &str,
    field: &str,
    value: &FieldValue,
    count: u64,
) -> Option<(Vec<u8>, Vec<u8>)> {
    equality_bytes(value).map(|bytes| {
        (
            count_key(collection, field, &bytes),
            count.to_le_bytes().to_vec(),
        )
    })
}
