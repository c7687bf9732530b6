//! Key encoding and decoding for every column family.
//!
//! Deterministic, prefix-scannable layouts. Variable-length user segments
//! (index values, edge types, series keys) are escape-terminated so that
//! one encoded value can never be a byte prefix of another: `0x00` bytes
//! are escaped as `0x00 0xFF` and the segment ends with `0x00 0x00`. The
//! escaping preserves lexicographic order, which the range index relies
//! on.

use crate::types::{Result, ThemisError};
use uuid::Uuid;

const SEG_TERM: [u8; 2] = [0x00, 0x00];

/// Escape a variable-length segment and append the terminator.
pub fn push_segment(out: &mut Vec<u8>, seg: &[u8]) {
    for &b in seg {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&SEG_TERM);
}

/// Upper bound (exclusive) for all keys whose escaped segment equals
/// `seg`, regardless of suffix: terminator `0x00 0x00` < continuation.
pub fn segment_upper_bound(prefix: &[u8], seg: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    for &b in seg {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
    out
}

// --- entity CF: {collection}:{uuid} ---

pub fn entity_key(collection: &str, uuid: Uuid) -> Vec<u8> {
    format!("{collection}:{uuid}").into_bytes()
}

pub fn entity_prefix(collection: &str) -> Vec<u8> {
    format!("{collection}:").into_bytes()
}

/// Decode `(collection, uuid)` from an entity key.
pub fn decode_entity_key(key: &[u8]) -> Result<(String, Uuid)> {
    let s = std::str::from_utf8(key)
        .map_err(|_| ThemisError::IndexCorrupt("non-UTF8 entity key".into()))?;
    let (collection, uuid_str) = s
        .rsplit_once(':')
        .ok_or_else(|| ThemisError::IndexCorrupt(format!("bad entity key '{s}'")))?;
    let uuid = Uuid::parse_str(uuid_str)
        .map_err(|_| ThemisError::IndexCorrupt(format!("bad uuid in entity key '{s}'")))?;
    Ok((collection.to_string(), uuid))
}

// --- idx_eq / idx_range CF: {collection}:{field}:{esc(value)}00 00{uuid} ---

fn field_prefix(collection: &str, field: &str) -> Vec<u8> {
    format!("{collection}:{field}:").into_bytes()
}

pub fn index_key(collection: &str, field: &str, value_bytes: &[u8], uuid: Uuid) -> Vec<u8> {
    let mut out = field_prefix(collection, field);
    push_segment(&mut out, value_bytes);
    out.extend_from_slice(uuid.to_string().as_bytes());
    out
}

/// Prefix covering every uuid for an exact value.
pub fn index_value_prefix(collection: &str, field: &str, value_bytes: &[u8]) -> Vec<u8> {
    let mut out = field_prefix(collection, field);
    push_segment(&mut out, value_bytes);
    out
}

/// `[lower, upper)` bounds for a range scan over `[lo, hi]` values.
/// Open endpoints use the field prefix itself / its successor.
pub fn range_bounds(
    collection: &str,
    field: &str,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
) -> (Vec<u8>, Vec<u8>) {
    let prefix = field_prefix(collection, field);
    let lower = match lo {
        Some(lo) => {
            let mut out = prefix.clone();
            for &b in lo {
                if b == 0x00 {
                    out.extend_from_slice(&[0x00, 0xFF]);
                } else {
                    out.push(b);
                }
            }
            out
        }
        None => prefix.clone(),
    };
    let upper = match hi {
        Some(hi) => segment_upper_bound(&prefix, hi),
        None => prefix_upper_bound(&prefix),
    };
    (lower, upper)
}

/// The uuid at the tail of an index key (fixed 36-byte hyphenated form).
pub fn decode_index_key_uuid(key: &[u8]) -> Result<Uuid> {
    if key.len() < 36 {
        return Err(ThemisError::IndexCorrupt("index key too short".into()));
    }
    let tail = &key[key.len() - 36..];
    let s = std::str::from_utf8(tail)
        .map_err(|_| ThemisError::IndexCorrupt("non-UTF8 uuid tail".into()))?;
    Uuid::parse_str(s).map_err(|_| ThemisError::IndexCorrupt(format!("bad uuid tail '{s}'")))
}

// --- graph CF: out:{from}:{esc(type)}00 00{edge_uuid} / in:{to}:... ---

pub fn graph_out_key(from: Uuid, edge_type: &str, edge: Uuid) -> Vec<u8> {
    let mut out = format!("out:{from}:").into_bytes();
    push_segment(&mut out, edge_type.as_bytes());
    out.extend_from_slice(edge.to_string().as_bytes());
    out
}

pub fn graph_in_key(to: Uuid, edge_type: &str, edge: Uuid) -> Vec<u8> {
    let mut out = format!("in:{to}:").into_bytes();
    push_segment(&mut out, edge_type.as_bytes());
    out.extend_from_slice(edge.to_string().as_bytes());
    out
}

/// Prefix for all outgoing (or incoming) edges of a vertex, optionally
/// narrowed to one edge type.
pub fn graph_prefix(direction_out: bool, vertex: Uuid, edge_type: Option<&str>) -> Vec<u8> {
    let dir = if direction_out { "out" } else { "in" };
    let mut out = format!("{dir}:{vertex}:").into_bytes();
    if let Some(t) = edge_type {
        push_segment(&mut out, t.as_bytes());
    }
    out
}

// --- idx_ft CF ---

/// Posting: `p:{collection}:{field}:{token}:{uuid}` → tf. Tokens are
/// analyzer output (alphanumeric only), no escaping needed.
pub fn ft_posting_key(collection: &str, field: &str, token: &str, uuid: Uuid) -> Vec<u8> {
    format!("p:{collection}:{field}:{token}:{uuid}").into_bytes()
}

pub fn ft_token_prefix(collection: &str, field: &str, token: &str) -> Vec<u8> {
    format!("p:{collection}:{field}:{token}:").into_bytes()
}

/// Per-document length sidecar.
pub fn ft_doclen_key(collection: &str, field: &str, uuid: Uuid) -> Vec<u8> {
    format!("d:{collection}:{field}:{uuid}").into_bytes()
}

/// Per-(collection, field) term statistics record.
pub fn ft_stats_key(collection: &str, field: &str) -> Vec<u8> {
    format!("s:{collection}:{field}").into_bytes()
}

// --- idx_spatial CF: {collection}:{field}:{morton be}{uuid} ---

pub fn spatial_key(collection: &str, field: &str, morton: u64, uuid: Uuid) -> Vec<u8> {
    let mut out = field_prefix(collection, field);
    out.extend_from_slice(&morton.to_be_bytes());
    out.extend_from_slice(uuid.to_string().as_bytes());
    out
}

/// `[lower, upper)` bounds for one Morton code range.
pub fn spatial_bounds(
    collection: &str,
    field: &str,
    code_start: u64,
    code_end: u64,
) -> (Vec<u8>, Vec<u8>) {
    let prefix = field_prefix(collection, field);
    let mut lower = prefix.clone();
    lower.extend_from_slice(&code_start.to_be_bytes());
    let mut upper = prefix;
    upper.extend_from_slice(&code_end.to_be_bytes());
    (lower, upper)
}

// --- ts CF: {collection}:{esc(series)}00 00{bucket be} ---

pub fn ts_key(collection: &str, series_key: &str, bucket_id: u64) -> Vec<u8> {
    let mut out = format!("{collection}:").into_bytes();
    push_segment(&mut out, series_key.as_bytes());
    out.extend_from_slice(&bucket_id.to_be_bytes());
    out
}

pub fn ts_series_prefix(collection: &str, series_key: &str) -> Vec<u8> {
    let mut out = format!("{collection}:").into_bytes();
    push_segment(&mut out, series_key.as_bytes());
    out
}

// --- vector_wal CF: {seq be} ---

pub fn vector_wal_key(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

pub fn decode_vector_wal_key(key: &[u8]) -> Result<u64> {
    let b: [u8; 8] = key
        .try_into()
        .map_err(|_| ThemisError::IndexCorrupt("bad vector wal key".into()))?;
    Ok(u64::from_be_bytes(b))
}

// --- audit CF: {ts_ms be}:{event uuid} ---

pub fn audit_key(ts_ms: i64, event_id: Uuid) -> Vec<u8> {
    let mut out = (ts_ms as u64).to_be_bytes().to_vec();
    out.push(b':');
    out.extend_from_slice(event_id.to_string().as_bytes());
    out
}

// --- meta CF ---

pub fn descriptor_key(collection: &str) -> Vec<u8> {
    format!("desc:{collection}").into_bytes()
}

/// Cached approximate count for an equality value.
pub fn count_key(collection: &str, field: &str, value_bytes: &[u8]) -> Vec<u8> {
    let digest = blake3::hash(value_bytes);
    format!("count:{collection}:{field}:{}", digest.to_hex()).into_bytes()
}

/// Applied-sequence watermark of the vector intent applier.
pub fn vector_watermark_key() -> Vec<u8> {
    b"vector:applied_seq".to_vec()
}

/// Successor of a prefix for exclusive upper bounds.
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return out;
        }
        out.pop();
    }
    // All-0xFF prefix: unbounded in practice.
    vec![0xFF; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_roundtrip() {
        let uuid = Uuid::new_v4();
        let key = entity_key("users", uuid);
        let (coll, parsed) = decode_entity_key(&key).unwrap();
        assert_eq!(coll, "users");
        assert_eq!(parsed, uuid);
    }

    #[test]
    fn test_value_prefix_not_prefix_of_longer_value() {
        let u = Uuid::new_v4();
        // "ab" must not match entries for "ab:" or "abc".
        let key_abc = index_key("c", "f", b"abc", u);
        let key_abcolon = index_key("c", "f", b"ab:", u);
        let prefix_ab = index_value_prefix("c", "f", b"ab");
        assert!(!key_abc.starts_with(&prefix_ab));
        assert!(!key_abcolon.starts_with(&prefix_ab));
        let key_ab = index_key("c", "f", b"ab", u);
        assert!(key_ab.starts_with(&prefix_ab));
    }

    #[test]
    fn test_escaping_preserves_order() {
        // Values with embedded zero bytes keep their relative order.
        let vals: [&[u8]; 4] = [b"\x00", b"\x00\x01", b"\x01", b"\x01\x00"];
        let keys: Vec<Vec<u8>> = vals
            .iter()
            .map(|v| index_key("c", "f", v, Uuid::nil()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_range_bounds_cover_inclusive_endpoints() {
        let u = Uuid::new_v4();
        let (lower, upper) = range_bounds("c", "f", Some(b"b"), Some(b"d"));
        for (val, expect) in [
            (&b"a"[..], false),
            (b"b", true),
            (b"c", true),
            (b"d", true),
            (b"da", false),
            (b"e", false),
        ] {
            let key = index_key("c", "f", val, u);
            let inside = key >= lower && key < upper;
            assert_eq!(inside, expect, "value {val:?}");
        }
    }

    #[test]
    fn test_index_key_uuid_tail() {
        let uuid = Uuid::new_v4();
        let key = index_key("users", "age", b"\x01\x02\x03", uuid);
        assert_eq!(decode_index_key_uuid(&key).unwrap(), uuid);
    }

    #[test]
    fn test_graph_prefix_narrows_by_type() {
        let v = Uuid::new_v4();
        let e = Uuid::new_v4();
        let key = graph_out_key(v, "road", e);
        assert!(key.starts_with(&graph_prefix(true, v, None)));
        assert!(key.starts_with(&graph_prefix(true, v, Some("road"))));
        assert!(!key.starts_with(&graph_prefix(true, v, Some("rail"))));
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"abc"), b"abd".to_vec());
        assert_eq!(prefix_upper_bound(&[0x61, 0xFF]), vec![0x62]);
    }

    #[test]
    fn test_spatial_bounds_order() {
        let (lo, hi) = spatial_bounds("c", "geom", 100, 200);
        assert!(lo < hi);
        let key = spatial_key("c", "geom", 150, Uuid::nil());
        assert!(key >= lo && key < hi);
        let outside = spatial_key("c", "geom", 200, Uuid::nil());
        assert!(outside >= hi);
    }
}
