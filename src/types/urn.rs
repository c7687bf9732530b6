//! URN parsing and formatting.
//!
//! The URN is the only identifier accepted across the interface. Format:
//! `urn:themis:{model}:{namespace}:{collection}:{uuid}`.

use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const URN_PREFIX: &str = "urn:themis";

/// Data model a URN belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataModel {
    Relational,
    Graph,
    Vector,
    Timeseries,
    Document,
    Content,
}

impl DataModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Graph => "graph",
            Self::Vector => "vector",
            Self::Timeseries => "timeseries",
            Self::Document => "document",
            Self::Content => "content",
        }
    }
}

impl FromStr for DataModel {
    type Err = ThemisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relational" => Ok(Self::Relational),
            "graph" => Ok(Self::Graph),
            "vector" => Ok(Self::Vector),
            "timeseries" => Ok(Self::Timeseries),
            "document" => Ok(Self::Document),
            "content" => Ok(Self::Content),
            other => Err(ThemisError::InvalidUrn(format!("unknown model '{other}'"))),
        }
    }
}

/// Parsed entity URN.
///
/// `(collection, uuid)` uniquely identifies an entity; model and namespace
/// scope routing and policy. `format(parse(s)) == s` for every valid `s`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Urn {
    pub model: DataModel,
    pub namespace: String,
    pub collection: String,
    pub uuid: Uuid,
}

impl Urn {
    /// Build a URN from parts.
    pub fn new(model: DataModel, namespace: &str, collection: &str, uuid: Uuid) -> Self {
        Self {
            model,
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            uuid,
        }
    }

    /// Parse a URN string.
    ///
    /// # Errors
    ///
    /// Returns `ThemisError::InvalidUrn` on any grammar violation: wrong
    /// prefix, missing segments, empty namespace/collection, non-v4 UUID
    /// syntax.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(URN_PREFIX)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| ThemisError::InvalidUrn(format!("missing '{URN_PREFIX}:' prefix")))?;

        let mut parts = rest.splitn(4, ':');
        let model = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ThemisError::InvalidUrn("missing model".into()))?
            .parse::<DataModel>()?;
        let namespace = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ThemisError::InvalidUrn("missing namespace".into()))?;
        let collection = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ThemisError::InvalidUrn("missing collection".into()))?;
        let uuid_str = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ThemisError::InvalidUrn("missing uuid".into()))?;

        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|e| ThemisError::InvalidUrn(format!("bad uuid '{uuid_str}': {e}")))?;

        Ok(Self {
            model,
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            uuid,
        })
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URN_PREFIX}:{}:{}:{}:{}",
            self.model.as_str(),
            self.namespace,
            self.collection,
            self.uuid
        )
    }
}

impl FromStr for Urn {
    type Err = ThemisError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_roundtrip() {
        let s = "urn:themis:relational:tenant-a:users:8f14e45f-ceea-4e7f-a2f0-946c61bfb0cd";
        let urn = Urn::parse(s).unwrap();
        assert_eq!(urn.model, DataModel::Relational);
        assert_eq!(urn.namespace, "tenant-a");
        assert_eq!(urn.collection, "users");
        assert_eq!(urn.to_string(), s);
    }

    #[test]
    fn test_all_models_parse() {
        for model in ["relational", "graph", "vector", "timeseries", "document", "content"] {
            let s = format!("urn:themis:{model}:ns:coll:{}", Uuid::new_v4());
            let urn = Urn::parse(&s).unwrap();
            assert_eq!(urn.to_string(), s);
        }
    }

    #[test]
    fn test_rejects_bad_prefix() {
        assert!(Urn::parse("urn:other:graph:ns:c:00000000-0000-4000-8000-000000000000").is_err());
        assert!(Urn::parse("themis:graph:ns:c:00000000-0000-4000-8000-000000000000").is_err());
    }

    #[test]
    fn test_rejects_missing_segments() {
        assert!(Urn::parse("urn:themis:graph:ns").is_err());
        assert!(Urn::parse("urn:themis:graph:::").is_err());
        assert!(Urn::parse("urn:themis:graph:ns:c:not-a-uuid").is_err());
    }

    #[test]
    fn test_rejects_unknown_model() {
        let s = format!("urn:themis:blob:ns:c:{}", Uuid::new_v4());
        assert!(matches!(Urn::parse(&s), Err(ThemisError::InvalidUrn(_))));
    }
}
