//! Self-describing field values.
//!
//! Entities are schemaless; every field carries its own type. The variants
//! here are exactly the payload types the blob codec can frame.

use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single field value. Typed per-value, no schema coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    /// 64-bit signed integer (also used for `timestamp`)
    Int(i64),
    Float(f64),
    Text(String),
    /// Opaque bytes (EWKB geometry lives here)
    Bytes(Vec<u8>),
    /// Ordered 32-bit float sequence (embeddings)
    FloatVec(Vec<f32>),
    /// Set of strings (`_labels`)
    StringSet(BTreeSet<String>),
}

impl FieldValue {
    /// Type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::FloatVec(_) => "float_vec",
            Self::StringSet(_) => "string_set",
        }
    }

    /// Codec type tag. Stable across releases; append-only.
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Text(_) => 4,
            Self::Bytes(_) => 5,
            Self::FloatVec(_) => 6,
            Self::StringSet(_) => 7,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_vec(&self) -> Option<&[f32]> {
        match self {
            Self::FloatVec(v) => Some(v),
            _ => None,
        }
    }

    /// Convert from a JSON value at the admission boundary.
    ///
    /// Arrays of numbers become `FloatVec`; arrays of strings become
    /// `StringSet`; anything else non-scalar is rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(ThemisError::invalid(format!("unrepresentable number {n}")))
                }
            }
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(items) => {
                if items.iter().all(|v| v.is_number()) {
                    let floats = items
                        .iter()
                        .map(|v| v.as_f64().map(|f| f as f32))
                        .collect::<Option<Vec<f32>>>()
                        .ok_or_else(|| ThemisError::invalid("non-finite number in array"))?;
                    Ok(Self::FloatVec(floats))
                } else if items.iter().all(|v| v.is_string()) {
                    Ok(Self::StringSet(
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect(),
                    ))
                } else {
                    Err(ThemisError::invalid("mixed-type arrays are not supported"))
                }
            }
            Value::Object(_) => Err(ThemisError::invalid("nested objects are not supported")),
        }
    }

    /// Convert to a JSON value for the interface layer.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => json!(b),
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
            Self::Text(s) => json!(s),
            Self::Bytes(b) => json!(b),
            Self::FloatVec(v) => json!(v),
            Self::StringSet(s) => json!(s.iter().collect::<Vec<_>>()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_scalar_conversion() {
        assert_eq!(FieldValue::from_json(&json!(42)).unwrap(), FieldValue::Int(42));
        assert_eq!(FieldValue::from_json(&json!(1.5)).unwrap(), FieldValue::Float(1.5));
        assert_eq!(
            FieldValue::from_json(&json!("hi")).unwrap(),
            FieldValue::Text("hi".into())
        );
        assert_eq!(FieldValue::from_json(&json!(null)).unwrap(), FieldValue::Null);
    }

    #[test]
    fn test_json_numeric_array_is_float_vec() {
        let v = FieldValue::from_json(&json!([0.1, 0.5, -0.2])).unwrap();
        assert!(matches!(v, FieldValue::FloatVec(ref f) if f.len() == 3));
    }

    #[test]
    fn test_json_string_array_is_string_set() {
        let v = FieldValue::from_json(&json!(["person", "customer"])).unwrap();
        match v {
            FieldValue::StringSet(s) => {
                assert!(s.contains("person"));
                assert!(s.contains("customer"));
            }
            other => panic!("expected StringSet, got {other:?}"),
        }
    }

    #[test]
    fn test_json_rejects_objects_and_mixed_arrays() {
        assert!(FieldValue::from_json(&json!({"a": 1})).is_err());
        assert!(FieldValue::from_json(&json!([1, "x"])).is_err());
    }
}
