//! Entity blob codec.
//!
//! Entities are stored as a length-prefixed, tag-framed binary blob:
//! a fixed system header followed by `(field_id varint, type_tag u8,
//! payload_len varint, payload)` frames. Field ids are stable per
//! collection, assigned at first observation and persisted in the
//! collection descriptor.
//!
//! The codec supports fast field extraction: given a blob and a field id,
//! locate and decode only that field without materializing the entity.
//! This runs on every write (index deltas for exactly the changed fields)
//! and on hot read paths (predicate recheck on candidates).

pub mod sortable;

use crate::geo::GeoSidecar;
use crate::types::{fields, Entity, FieldValue, Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAGIC: u8 = 0xEB;
const FORMAT_VERSION: u8 = 1;
const FLAG_GEO_SIDECAR: u8 = 0b0000_0001;

/// First id handed out to user-defined fields; lower ids are reserved for
/// well-known fields.
pub const FIRST_USER_FIELD_ID: u32 = 16;

/// Reserved id for a well-known field name, if any.
pub fn reserved_field_id(name: &str) -> Option<u32> {
    match name {
        fields::LABELS => Some(1),
        fields::EDGE_TYPE => Some(2),
        fields::FROM => Some(3),
        fields::TO => Some(4),
        fields::EMBEDDING => Some(5),
        fields::GEOMETRY => Some(6),
        fields::TIMESTAMP => Some(7),
        fields::TEXT_CONTENT => Some(8),
        _ => None,
    }
}

fn reserved_field_name(id: u32) -> Option<&'static str> {
    match id {
        1 => Some(fields::LABELS),
        2 => Some(fields::EDGE_TYPE),
        3 => Some(fields::FROM),
        4 => Some(fields::TO),
        5 => Some(fields::EMBEDDING),
        6 => Some(fields::GEOMETRY),
        7 => Some(fields::TIMESTAMP),
        8 => Some(fields::TEXT_CONTENT),
        _ => None,
    }
}

/// Per-collection field name ↔ id table, persisted in the collection
/// descriptor under the `meta` CF.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldTable {
    by_name: BTreeMap<String, u32>,
    next_id: u32,
}

impl FieldTable {
    pub fn new() -> Self {
        Self { by_name: BTreeMap::new(), next_id: FIRST_USER_FIELD_ID }
    }

    /// Resolve a field name, assigning a fresh id at first observation.
    ///
    /// Returns `(id, newly_assigned)`; a `true` flag obliges the caller to
    /// persist the descriptor in the same transaction.
    pub fn resolve_or_assign(&mut self, name: &str) -> (u32, bool) {
        if let Some(id) = reserved_field_id(name) {
            return (id, false);
        }
        if let Some(id) = self.by_name.get(name) {
            return (*id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(name.to_string(), id);
        (id, true)
    }

    /// Resolve without assigning.
    pub fn resolve(&self, name: &str) -> Option<u32> {
        reserved_field_id(name).or_else(|| self.by_name.get(name).copied())
    }

    /// Reverse lookup for decoding.
    pub fn name_of(&self, id: u32) -> Option<String> {
        if let Some(name) = reserved_field_name(id) {
            return Some(name.to_string());
        }
        self.by_name
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
    }
}

/// Encode an entity to its blob form.
///
/// Assigns fresh field ids through `table` as needed; the caller persists
/// the updated table if `encode` reports new assignments via
/// `FieldTable::resolve_or_assign` beforehand (see `txn::stage_put`).
pub fn encode(entity: &Entity, table: &mut FieldTable) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    out.push(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&entity.version.to_le_bytes());
    out.extend_from_slice(&entity.created_at.to_le_bytes());
    out.extend_from_slice(&entity.updated_at.to_le_bytes());

    let flags = if entity.geo_sidecar.is_some() { FLAG_GEO_SIDECAR } else { 0 };
    out.push(flags);
    if let Some(sidecar) = &entity.geo_sidecar {
        let bytes = bincode::serialize(sidecar)?;
        write_varint(&mut out, bytes.len() as u64);
        out.extend_from_slice(&bytes);
    }

    for (name, value) in &entity.fields {
        let (id, _) = table.resolve_or_assign(name);
        write_varint(&mut out, id as u64);
        out.push(value.type_tag());
        let payload = encode_payload(value);
        write_varint(&mut out, payload.len() as u64);
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

/// Decode a blob back into an entity.
pub fn decode(blob: &[u8], table: &FieldTable) -> Result<Entity> {
    let mut cur = Reader::new(blob);
    let (version, created_at, updated_at, geo_sidecar) = read_header(&mut cur)?;

    let mut fields = BTreeMap::new();
    while !cur.at_end() {
        let id = cur.varint()? as u32;
        let tag = cur.u8()?;
        let len = cur.varint()? as usize;
        let payload = cur.take(len)?;
        let name = table
            .name_of(id)
            .ok_or(ThemisError::UnknownFieldId(id))?;
        fields.insert(name, decode_payload(tag, payload)?);
    }

    Ok(Entity { version, created_at, updated_at, fields, geo_sidecar })
}

/// Decode only the system header (version and timestamps).
pub fn decode_header(blob: &[u8]) -> Result<(u64, i64, i64)> {
    let mut cur = Reader::new(blob);
    let (version, created_at, updated_at, _) = read_header(&mut cur)?;
    Ok((version, created_at, updated_at))
}

/// Decode only the geo sidecar, if present.
pub fn decode_geo_sidecar(blob: &[u8]) -> Result<Option<GeoSidecar>> {
    let mut cur = Reader::new(blob);
    let (_, _, _, sidecar) = read_header(&mut cur)?;
    Ok(sidecar)
}

/// Locate and decode a single field by id without materializing the
/// entity. Returns `Ok(None)` when the field is absent.
pub fn extract_field(blob: &[u8], field_id: u32) -> Result<Option<FieldValue>> {
    let mut cur = Reader::new(blob);
    read_header(&mut cur)?;

    while !cur.at_end() {
        let id = cur.varint()? as u32;
        let tag = cur.u8()?;
        let len = cur.varint()? as usize;
        if id == field_id {
            let payload = cur.take(len)?;
            return decode_payload(tag, payload).map(Some);
        }
        cur.skip(len)?;
    }
    Ok(None)
}

fn read_header(cur: &mut Reader<'_>) -> Result<(u64, i64, i64, Option<GeoSidecar>)> {
    if cur.u8()? != MAGIC {
        return Err(ThemisError::malformed("bad magic byte"));
    }
    let fmt = cur.u8()?;
    if fmt != FORMAT_VERSION {
        return Err(ThemisError::malformed(format!("unsupported blob format {fmt}")));
    }
    let version = u64::from_le_bytes(cur.take(8)?.try_into().unwrap());
    let created_at = i64::from_le_bytes(cur.take(8)?.try_into().unwrap());
    let updated_at = i64::from_le_bytes(cur.take(8)?.try_into().unwrap());
    let flags = cur.u8()?;
    let sidecar = if flags & FLAG_GEO_SIDECAR != 0 {
        let len = cur.varint()? as usize;
        let bytes = cur.take(len)?;
        Some(bincode::deserialize(bytes)?)
    } else {
        None
    };
    Ok((version, created_at, updated_at, sidecar))
}

fn encode_payload(value: &FieldValue) -> Vec<u8> {
    match value {
        FieldValue::Null => Vec::new(),
        FieldValue::Bool(b) => vec![u8::from(*b)],
        FieldValue::Int(i) => i.to_le_bytes().to_vec(),
        FieldValue::Float(f) => f.to_le_bytes().to_vec(),
        FieldValue::Text(s) => s.as_bytes().to_vec(),
        FieldValue::Bytes(b) => b.clone(),
        FieldValue::FloatVec(v) => {
            let mut out = Vec::with_capacity(v.len() * 4);
            for f in v {
                out.extend_from_slice(&f.to_le_bytes());
            }
            out
        }
        FieldValue::StringSet(set) => {
            let mut out = Vec::new();
            write_varint(&mut out, set.len() as u64);
            for s in set {
                write_varint(&mut out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            out
        }
    }
}

fn decode_payload(tag: u8, payload: &[u8]) -> Result<FieldValue> {
    match tag {
        0 => Ok(FieldValue::Null),
        1 => match payload {
            [0] => Ok(FieldValue::Bool(false)),
            [1] => Ok(FieldValue::Bool(true)),
            _ => Err(ThemisError::malformed("bad bool payload")),
        },
        2 => {
            let b: [u8; 8] = payload
                .try_into()
                .map_err(|_| ThemisError::malformed("bad int payload"))?;
            Ok(FieldValue::Int(i64::from_le_bytes(b)))
        }
        3 => {
            let b: [u8; 8] = payload
                .try_into()
                .map_err(|_| ThemisError::malformed("bad float payload"))?;
            Ok(FieldValue::Float(f64::from_le_bytes(b)))
        }
        4 => Ok(FieldValue::Text(
            String::from_utf8(payload.to_vec())
                .map_err(|_| ThemisError::malformed("non-UTF8 text payload"))?,
        )),
        5 => Ok(FieldValue::Bytes(payload.to_vec())),
        6 => {
            if payload.len() % 4 != 0 {
                return Err(ThemisError::malformed("float vec payload not 4-aligned"));
            }
            Ok(FieldValue::FloatVec(
                payload
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            ))
        }
        7 => {
            let mut cur = Reader::new(payload);
            let count = cur.varint()? as usize;
            let mut set = std::collections::BTreeSet::new();
            for _ in 0..count {
                let len = cur.varint()? as usize;
                let bytes = cur.take(len)?;
                set.insert(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| ThemisError::malformed("non-UTF8 set member"))?,
                );
            }
            Ok(FieldValue::StringSet(set))
        }
        other => Err(ThemisError::malformed(format!("unknown type tag {other}"))),
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ThemisError::malformed(format!(
                "blob truncated at offset {}",
                self.pos
            )));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(ThemisError::malformed("varint overflow"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Coord, Geometry};
    use serde_json::json;

    fn sample_entity() -> Entity {
        let mut entity = Entity::from_json(&json!({
            "age": 30,
            "score": 0.87,
            "name": "ada",
            "active": true,
            "embedding": [0.1, 0.5, -0.2],
            "_labels": ["person", "customer"],
            "text_content": "hello world"
        }))
        .unwrap();
        entity.set(
            fields::GEOMETRY,
            FieldValue::Bytes(Geometry::Point(Coord::new(13.4, 52.5)).to_ewkb()),
        );
        entity
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entity = sample_entity();
        let mut table = FieldTable::new();
        let blob = encode(&entity, &mut table).unwrap();
        let decoded = decode(&blob, &table).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_header_only_decode() {
        let entity = sample_entity();
        let mut table = FieldTable::new();
        let blob = encode(&entity, &mut table).unwrap();
        let (version, created_at, updated_at) = decode_header(&blob).unwrap();
        assert_eq!(version, entity.version);
        assert_eq!(created_at, entity.created_at);
        assert_eq!(updated_at, entity.updated_at);
    }

    #[test]
    fn test_extract_field_without_full_decode() {
        let entity = sample_entity();
        let mut table = FieldTable::new();
        let blob = encode(&entity, &mut table).unwrap();

        let age_id = table.resolve("age").unwrap();
        assert_eq!(extract_field(&blob, age_id).unwrap(), Some(FieldValue::Int(30)));

        // Reserved ids resolve without the table.
        let emb = extract_field(&blob, reserved_field_id(fields::EMBEDDING).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(emb.as_float_vec().unwrap().len(), 3);

        // Absent field id.
        assert_eq!(extract_field(&blob, 9999).unwrap(), None);
    }

    #[test]
    fn test_field_ids_stable_across_encodes() {
        let mut table = FieldTable::new();
        let e1 = Entity::from_json(&json!({"a": 1, "b": 2})).unwrap();
        let _ = encode(&e1, &mut table).unwrap();
        let a_id = table.resolve("a").unwrap();

        let e2 = Entity::from_json(&json!({"b": 5, "a": 9, "c": 1})).unwrap();
        let _ = encode(&e2, &mut table).unwrap();
        assert_eq!(table.resolve("a").unwrap(), a_id);
        assert!(table.resolve("c").unwrap() >= FIRST_USER_FIELD_ID);
    }

    #[test]
    fn test_unknown_field_id_is_error() {
        let mut table = FieldTable::new();
        let entity = Entity::from_json(&json!({"a": 1})).unwrap();
        let blob = encode(&entity, &mut table).unwrap();
        // Decode against a table that never saw "a".
        let fresh = FieldTable::new();
        assert!(matches!(
            decode(&blob, &fresh),
            Err(ThemisError::UnknownFieldId(_))
        ));
    }

    #[test]
    fn test_truncated_blob_is_malformed() {
        let mut table = FieldTable::new();
        let entity = sample_entity();
        let blob = encode(&entity, &mut table).unwrap();
        for cut in [1, 5, blob.len() / 2, blob.len() - 1] {
            assert!(
                matches!(decode(&blob[..cut], &table), Err(_)),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn test_geo_sidecar_roundtrip() {
        let entity = sample_entity();
        let mut table = FieldTable::new();
        let blob = encode(&entity, &mut table).unwrap();
        let sidecar = decode_geo_sidecar(&blob).unwrap().unwrap();
        assert_eq!(sidecar.centroid, (13.4, 52.5));
    }
}
