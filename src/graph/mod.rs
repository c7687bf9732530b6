//! Graph adjacency projection and traversal.
//!
//! Edges are entities in their own right, owned by neither endpoint; the
//! adjacency projection mirrors each edge into a forward (`out:`) and a
//! reverse (`in:`) key so a prefix scan yields all outgoing or incoming
//! edges of a vertex. Deleting a vertex does not cascade: callers use
//! these scans to find and remove edges explicitly.

pub mod traversal;

pub use traversal::{Traverser, TraversalConstraints, TraversalPath};

use crate::storage::keys::{graph_in_key, graph_out_key, graph_prefix};
use crate::storage::{SnapshotView, CF_GRAPH, SCAN_BATCH_SIZE};
use crate::types::{Entity, Result, ThemisError, Urn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value stored at both adjacency keys of an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// URN of the edge entity itself (for weight/property loads)
    pub edge_urn: String,
    /// URN of the vertex at the far end, in scan direction
    pub other_urn: String,
    pub edge_type: String,
}

/// Staged mutations for the graph CF.
#[derive(Debug, Default)]
pub struct GraphDelta {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

/// Compute adjacency deltas for an edge entity write.
///
/// Non-edge entities produce nothing. Fires when the entity is an edge in
/// either image and any of `_from`, `_to`, `_type` changed (or the edge
/// is created/erased).
pub fn compute_delta(
    edge_urn: &Urn,
    pre: Option<&Entity>,
    post: Option<&Entity>,
) -> Result<GraphDelta> {
    let mut delta = GraphDelta::default();

    let pre_ends = endpoints(pre)?;
    let post_ends = endpoints(post)?;
    if pre_ends == post_ends {
        return Ok(delta);
    }

    if let Some((from, to, edge_type)) = &pre_ends {
        delta
            .deletes
            .push(graph_out_key(from.uuid, edge_type, edge_urn.uuid));
        delta
            .deletes
            .push(graph_in_key(to.uuid, edge_type, edge_urn.uuid));
    }
    if let Some((from, to, edge_type)) = &post_ends {
        let out_record = EdgeRecord {
            edge_urn: edge_urn.to_string(),
            other_urn: to.to_string(),
            edge_type: edge_type.clone(),
        };
        let in_record = EdgeRecord {
            edge_urn: edge_urn.to_string(),
            other_urn: from.to_string(),
            edge_type: edge_type.clone(),
        };
        delta.puts.push((
            graph_out_key(from.uuid, edge_type, edge_urn.uuid),
            bincode::serialize(&out_record)?,
        ));
        delta.puts.push((
            graph_in_key(to.uuid, edge_type, edge_urn.uuid),
            bincode::serialize(&in_record)?,
        ));
    }
    Ok(delta)
}

fn endpoints(entity: Option<&Entity>) -> Result<Option<(Urn, Urn, String)>> {
    let Some(entity) = entity else {
        return Ok(None);
    };
    if !entity.is_edge() {
        return Ok(None);
    }
    let from = entity
        .from_urn()?
        .ok_or_else(|| ThemisError::malformed("edge without _from"))?;
    let to = entity
        .to_urn()?
        .ok_or_else(|| ThemisError::malformed("edge without _to"))?;
    let edge_type = entity.edge_type().unwrap_or("").to_string();
    Ok(Some((from, to, edge_type)))
}

/// One hop from a vertex, in either direction.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub edge: Uuid,
    pub edge_urn: Urn,
    pub other: Urn,
    pub edge_type: String,
}

/// Scan the adjacency of a vertex. O(k log N) in the number of edges.
pub fn neighbors(
    view: &SnapshotView<'_>,
    vertex: Uuid,
    outgoing: bool,
    edge_type: Option<&str>,
) -> Result<Vec<Neighbor>> {
    let prefix = graph_prefix(outgoing, vertex, edge_type);
    let upper = crate::storage::keys::prefix_upper_bound(&prefix);
    let mut out = Vec::new();
    let mut resume: Option<Vec<u8>> = None;
    loop {
        let batch = view.scan_batch(CF_GRAPH, &prefix, &upper, resume.as_deref(), SCAN_BATCH_SIZE)?;
        if batch.is_empty() {
            return Ok(out);
        }
        for (_, value) in &batch {
            let record: EdgeRecord = bincode::deserialize(value)
                .map_err(|_| ThemisError::IndexCorrupt("bad adjacency record".into()))?;
            let edge_urn = Urn::parse(&record.edge_urn)
                .map_err(|_| ThemisError::IndexCorrupt("bad edge urn in adjacency".into()))?;
            let other = Urn::parse(&record.other_urn)
                .map_err(|_| ThemisError::IndexCorrupt("bad vertex urn in adjacency".into()))?;
            out.push(Neighbor {
                edge: edge_urn.uuid,
                edge_urn,
                other,
                edge_type: record.edge_type,
            });
        }
        resume = Some(batch.last().unwrap().0.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{fields, DataModel, FieldValue};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn urn(collection: &str) -> Urn {
        Urn::new(DataModel::Graph, "t", collection, Uuid::new_v4())
    }

    fn edge_entity(from: &Urn, to: &Urn, edge_type: &str) -> Entity {
        let mut f = BTreeMap::new();
        f.insert(fields::FROM.into(), FieldValue::Text(from.to_string()));
        f.insert(fields::TO.into(), FieldValue::Text(to.to_string()));
        f.insert(fields::EDGE_TYPE.into(), FieldValue::Text(edge_type.into()));
        Entity::new(f)
    }

    #[test]
    fn test_edge_delta_creates_both_directions() {
        let (a, b, e) = (urn("nodes"), urn("nodes"), urn("edges"));
        let edge = edge_entity(&a, &b, "road");
        let delta = compute_delta(&e, None, Some(&edge)).unwrap();
        assert_eq!(delta.puts.len(), 2);
        assert!(delta.deletes.is_empty());
    }

    #[test]
    fn test_endpoint_change_moves_adjacency() {
        let (a, b, c, e) = (urn("nodes"), urn("nodes"), urn("nodes"), urn("edges"));
        let before = edge_entity(&a, &b, "road");
        let after = edge_entity(&a, &c, "road");
        let delta = compute_delta(&e, Some(&before), Some(&after)).unwrap();
        assert_eq!(delta.deletes.len(), 2);
        assert_eq!(delta.puts.len(), 2);
    }

    #[test]
    fn test_non_edge_entity_is_inert() {
        let e = urn("things");
        let entity = Entity::from_json(&serde_json::json!({"name": "x"})).unwrap();
        let delta = compute_delta(&e, None, Some(&entity)).unwrap();
        assert!(delta.puts.is_empty() && delta.deletes.is_empty());
    }

    #[test]
    fn test_neighbors_scan() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let (a, b, c) = (urn("nodes"), urn("nodes"), urn("nodes"));
        for (to, edge_type) in [(&b, "road"), (&c, "rail")] {
            let e = urn("edges");
            let delta = compute_delta(&e, None, Some(&edge_entity(&a, to, edge_type))).unwrap();
            for (k, v) in &delta.puts {
                storage.put(CF_GRAPH, k, v).unwrap();
            }
        }

        let view = storage.snapshot_view();
        let all = neighbors(&view, a.uuid, true, None).unwrap();
        assert_eq!(all.len(), 2);
        let road = neighbors(&view, a.uuid, true, Some("road")).unwrap();
        assert_eq!(road.len(), 1);
        assert_eq!(road[0].other.uuid, b.uuid);

        // Reverse direction: b sees a as incoming.
        let incoming = neighbors(&view, b.uuid, false, None).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].other.uuid, a.uuid);
    }
}
