//! Query plan model.
//!
//! The core accepts typed plans, not query-language text; the AQL parser
//! is an external adapter that produces these structures. A plan combines
//! at most one candidate source per modality (structured predicate,
//! full-text, spatial, vector, graph) and the executor picks the hybrid
//! pipeline from which modalities are present.

use crate::geo::SpatialPredicate;
use crate::types::{Entity, FieldValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;

/// Structured predicate over entity fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Predicate {
    /// field == value
    Eq(String, FieldValue),
    /// field != value
    Ne(String, FieldValue),
    /// field > value
    Gt(String, FieldValue),
    /// field >= value
    Gte(String, FieldValue),
    /// field < value
    Lt(String, FieldValue),
    /// field <= value
    Lte(String, FieldValue),
    /// field IN values
    In(String, Vec<FieldValue>),
    /// field contains substring (text only)
    Contains(String, String),
    /// field IS NOT NULL
    Exists(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluate against a loaded entity. This is the exact recheck run on
    /// candidates; a failing candidate is filtered silently, never an
    /// error.
    pub fn evaluate(&self, entity: &Entity) -> bool {
        match self {
            Self::Eq(field, value) => entity.get(field) == Some(value),
            Self::Ne(field, value) => entity.get(field) != Some(value),
            Self::Gt(field, value) => {
                compare(entity.get(field), value) == Some(CmpOrdering::Greater)
            }
            Self::Gte(field, value) => matches!(
                compare(entity.get(field), value),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            ),
            Self::Lt(field, value) => compare(entity.get(field), value) == Some(CmpOrdering::Less),
            Self::Lte(field, value) => matches!(
                compare(entity.get(field), value),
                Some(CmpOrdering::Less | CmpOrdering::Equal)
            ),
            Self::In(field, values) => entity
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Self::Contains(field, needle) => entity
                .get(field)
                .and_then(|v| v.as_text())
                .map(|s| s.contains(needle))
                .unwrap_or(false),
            Self::Exists(field) => entity.get(field).is_some(),
            Self::And(preds) => preds.iter().all(|p| p.evaluate(entity)),
            Self::Or(preds) => preds.iter().any(|p| p.evaluate(entity)),
            Self::Not(pred) => !pred.evaluate(entity),
        }
    }

    /// Flatten a conjunction into its conjuncts. Non-AND predicates are a
    /// single conjunct.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Self::And(preds) => preds.iter().flat_map(|p| p.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Whether this conjunct can be compiled to an index probe (eq,
    /// range endpoint, or IN expansion).
    pub fn is_index_compilable(&self) -> bool {
        matches!(
            self,
            Self::Eq(..) | Self::Gt(..) | Self::Gte(..) | Self::Lt(..) | Self::Lte(..) | Self::In(..)
        )
    }
}

fn compare(lhs: Option<&FieldValue>, rhs: &FieldValue) -> Option<CmpOrdering> {
    match (lhs?, rhs) {
        (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
        (FieldValue::Float(a), FieldValue::Float(b)) => a.partial_cmp(b),
        (FieldValue::Int(a), FieldValue::Float(b)) => (*a as f64).partial_cmp(b),
        (FieldValue::Float(a), FieldValue::Int(b)) => a.partial_cmp(&(*b as f64)),
        (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Full-text clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtClause {
    pub field: String,
    pub query: String,
}

/// Spatial clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialClause {
    pub field: String,
    pub predicate: SpatialPredicate,
}

/// Vector clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorClause {
    pub field: String,
    pub query: Vec<f32>,
    pub k: usize,
    /// Per-query efSearch override
    pub ef_search: Option<usize>,
}

/// Result ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// A complete query plan against one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub namespace: Option<String>,
    pub collection: String,
    pub predicate: Option<Predicate>,
    pub fulltext: Option<FtClause>,
    pub spatial: Option<SpatialClause>,
    pub vector: Option<VectorClause>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// α for content+geo re-ranking: `α·BM25 + (1-α)·1/(1+distance)`
    pub rerank_alpha: Option<f32>,
    /// Best-effort scatter: report failing shards instead of failing fast
    pub best_effort: bool,
}

impl QueryPlan {
    pub fn scan(collection: &str) -> Self {
        Self {
            namespace: None,
            collection: collection.to_string(),
            predicate: None,
            fulltext: None,
            spatial: None,
            vector: None,
            order_by: None,
            limit: None,
            offset: 0,
            rerank_alpha: None,
            best_effort: false,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> Entity {
        Entity::from_json(&json!({
            "age": 30,
            "name": "ada",
            "category": "art"
        }))
        .unwrap()
    }

    #[test]
    fn test_comparison_predicates() {
        let e = entity();
        assert!(Predicate::Eq("age".into(), FieldValue::Int(30)).evaluate(&e));
        assert!(Predicate::Gt("age".into(), FieldValue::Int(29)).evaluate(&e));
        assert!(!Predicate::Lt("age".into(), FieldValue::Int(30)).evaluate(&e));
        assert!(Predicate::Gte("age".into(), FieldValue::Int(30)).evaluate(&e));
        // Cross-type numeric comparison.
        assert!(Predicate::Gt("age".into(), FieldValue::Float(29.5)).evaluate(&e));
    }

    #[test]
    fn test_logical_composition() {
        let e = entity();
        let p = Predicate::And(vec![
            Predicate::Eq("category".into(), FieldValue::Text("art".into())),
            Predicate::Or(vec![
                Predicate::Lt("age".into(), FieldValue::Int(10)),
                Predicate::Gt("age".into(), FieldValue::Int(20)),
            ]),
        ]);
        assert!(p.evaluate(&e));
        assert!(!Predicate::Not(Box::new(p)).evaluate(&e));
    }

    #[test]
    fn test_missing_field_semantics() {
        let e = entity();
        assert!(!Predicate::Eq("missing".into(), FieldValue::Int(1)).evaluate(&e));
        assert!(!Predicate::Exists("missing".into()).evaluate(&e));
        assert!(Predicate::Exists("age".into()).evaluate(&e));
    }

    #[test]
    fn test_conjunct_flattening() {
        let p = Predicate::And(vec![
            Predicate::Eq("a".into(), FieldValue::Int(1)),
            Predicate::And(vec![
                Predicate::Eq("b".into(), FieldValue::Int(2)),
                Predicate::Contains("c".into(), "x".into()),
            ]),
        ]);
        let conjuncts = p.conjuncts();
        assert_eq!(conjuncts.len(), 3);
        assert_eq!(
            conjuncts.iter().filter(|c| c.is_index_compilable()).count(),
            2
        );
    }
}
