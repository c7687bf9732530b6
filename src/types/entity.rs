//! Entity data model.
//!
//! Every logical object — a row, a graph vertex or edge, a vector-bearing
//! document, a time-series point bundle, a content chunk — is one entity:
//! a system header plus a self-describing field map.

use crate::geo::{GeoSidecar, Geometry};
use crate::types::{FieldValue, Result, ThemisError, Urn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Well-known field names. These get reserved low field ids so fast
/// extraction never consults the collection descriptor for them.
pub mod fields {
    pub const LABELS: &str = "_labels";
    pub const EDGE_TYPE: &str = "_type";
    pub const FROM: &str = "_from";
    pub const TO: &str = "_to";
    pub const EMBEDDING: &str = "embedding";
    pub const GEOMETRY: &str = "geometry";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TEXT_CONTENT: &str = "text_content";
}

/// A single data record with system header and user fields.
///
/// `version` strictly increases per URN under any committed write path;
/// timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Monotonic version, bumped on every committed mutation
    pub version: u64,

    /// Creation timestamp (epoch ms)
    pub created_at: i64,

    /// Last modification timestamp (epoch ms)
    pub updated_at: i64,

    /// Self-describing field map (schemaless, typed per-value)
    pub fields: BTreeMap<String, FieldValue>,

    /// Derived from `geometry`; recomputed whenever it changes
    pub geo_sidecar: Option<GeoSidecar>,
}

impl Entity {
    /// Create a new entity at version 1 with timestamps set to now.
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entity = Self {
            version: 1,
            created_at: now,
            updated_at: now,
            fields,
            geo_sidecar: None,
        };
        entity.refresh_geo_sidecar();
        entity
    }

    /// Build from a JSON object at the admission boundary.
    ///
    /// Byte-valued fields (EWKB geometry) arrive as JSON integer arrays;
    /// an all-byte array that parses as EWKB is stored as bytes, any
    /// other numeric array as a float vector.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ThemisError::malformed("entity body must be a JSON object"))?;
        let mut fields = BTreeMap::new();
        for (k, v) in obj {
            let mut field_value = FieldValue::from_json(v)?;
            if matches!(field_value, FieldValue::FloatVec(_)) {
                if let Some(bytes) = json_byte_array(v) {
                    if Geometry::parse_ewkb(&bytes).is_ok() {
                        field_value = FieldValue::Bytes(bytes);
                    }
                }
            }
            fields.insert(k.clone(), field_value);
        }
        Ok(Self::new(fields))
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Graph labels (`_labels`), empty set if absent.
    pub fn labels(&self) -> BTreeSet<String> {
        match self.fields.get(fields::LABELS) {
            Some(FieldValue::StringSet(s)) => s.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Edge type (`_type`); `None` for non-edge entities.
    pub fn edge_type(&self) -> Option<&str> {
        self.fields.get(fields::EDGE_TYPE).and_then(|v| v.as_text())
    }

    /// Whether this entity is a graph edge (`_from` and `_to` both set).
    pub fn is_edge(&self) -> bool {
        self.fields.contains_key(fields::FROM) && self.fields.contains_key(fields::TO)
    }

    /// Edge source endpoint as a parsed URN.
    pub fn from_urn(&self) -> Result<Option<Urn>> {
        self.endpoint_urn(fields::FROM)
    }

    /// Edge destination endpoint as a parsed URN.
    pub fn to_urn(&self) -> Result<Option<Urn>> {
        self.endpoint_urn(fields::TO)
    }

    fn endpoint_urn(&self, field: &str) -> Result<Option<Urn>> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(FieldValue::Text(s)) => Urn::parse(s).map(Some),
            Some(other) => Err(ThemisError::TypeMismatch {
                field: field.to_string(),
                expected: "text",
                actual: other.type_name(),
            }),
        }
    }

    /// Embedding vector if present.
    pub fn embedding(&self) -> Option<&[f32]> {
        self.fields.get(fields::EMBEDDING).and_then(|v| v.as_float_vec())
    }

    /// Decoded geometry if present.
    pub fn geometry(&self) -> Result<Option<Geometry>> {
        match self.fields.get(fields::GEOMETRY) {
            None => Ok(None),
            Some(FieldValue::Bytes(ewkb)) => Geometry::parse_ewkb(ewkb).map(Some),
            Some(other) => Err(ThemisError::TypeMismatch {
                field: fields::GEOMETRY.to_string(),
                expected: "bytes",
                actual: other.type_name(),
            }),
        }
    }

    /// Monotonic point timestamp if present.
    pub fn timestamp(&self) -> Option<i64> {
        self.fields.get(fields::TIMESTAMP).and_then(|v| v.as_int())
    }

    /// Full-text content if present.
    pub fn text_content(&self) -> Option<&str> {
        self.fields.get(fields::TEXT_CONTENT).and_then(|v| v.as_text())
    }

    /// Set a field, refreshing the geo sidecar when `geometry` changes.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        let is_geometry = name == fields::GEOMETRY;
        self.fields.insert(name, value);
        if is_geometry {
            self.refresh_geo_sidecar();
        }
    }

    /// Recompute the geo sidecar from the current `geometry` field.
    ///
    /// Unparseable geometry clears the sidecar; the codec rejects it
    /// properly at write admission.
    pub fn refresh_geo_sidecar(&mut self) {
        self.geo_sidecar = match self.geometry() {
            Ok(Some(geom)) => Some(GeoSidecar::from_geometry(&geom)),
            _ => None,
        };
    }

    /// Convert user fields to a JSON object for the interface layer.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

/// A JSON array of integers in 0..=255, as raw bytes.
fn json_byte_array(value: &serde_json::Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_u64().filter(|n| *n <= 255).map(|n| n as u8))
        .collect()
}
