//! Graph traversal: BFS, Dijkstra, bounded-depth expansion.
//!
//! Traversals run against one read snapshot. Frontier vertices are loaded
//! in batches through multi-get; a spatial filter prunes failing vertices
//! — pruned vertices are not expanded, so for shortest paths they cannot
//! appear on the returned route.

use crate::codec;
use crate::geo::{Geometry, SpatialPredicate};
use crate::graph::{neighbors, Neighbor};
use crate::storage::keys::entity_key;
use crate::storage::{DescriptorCache, SnapshotView, CF_ENTITY};
use crate::types::{Entity, FieldValue, Result, ThemisError, Urn};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Spatial constraint applied to every visited vertex.
#[derive(Debug, Clone)]
pub struct SpatialFilter {
    /// Vertex field holding EWKB geometry (e.g. `location`)
    pub field: String,
    pub predicate: SpatialPredicate,
}

/// Traversal constraints.
#[derive(Debug, Clone)]
pub struct TraversalConstraints {
    pub unique_vertices: bool,
    pub unique_edges: bool,
    pub forbidden_vertices: HashSet<Uuid>,
    pub forbidden_edges: HashSet<Uuid>,
    /// Total edge expansions allowed before `CycleBudget`
    pub max_edges: Option<usize>,
    pub edge_type: Option<String>,
    pub spatial_filter: Option<SpatialFilter>,
}

impl Default for TraversalConstraints {
    fn default() -> Self {
        Self {
            unique_vertices: true,
            unique_edges: true,
            forbidden_vertices: HashSet::new(),
            forbidden_edges: HashSet::new(),
            max_edges: Some(100_000),
            edge_type: None,
            spatial_filter: None,
        }
    }
}

/// A traversal result: the vertex sequence, the edges between them, and
/// the accumulated cost (hop count for BFS, weight sum for Dijkstra).
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalPath {
    pub vertices: Vec<Urn>,
    pub edges: Vec<Urn>,
    pub cost: f64,
}

/// Traversal engine bound to one snapshot.
pub struct Traverser<'a> {
    view: &'a SnapshotView<'a>,
    descriptors: &'a DescriptorCache,
}

impl<'a> Traverser<'a> {
    pub fn new(view: &'a SnapshotView<'a>, descriptors: &'a DescriptorCache) -> Self {
        Self { view, descriptors }
    }

    /// Breadth-first expansion with a depth window.
    ///
    /// Returns one path per reachable vertex whose depth lies in
    /// `[min_depth, max_depth]`, ordered by path length. `0..=0` returns
    /// just the start vertex (subject to the spatial filter).
    pub fn bfs(
        &self,
        start: &Urn,
        min_depth: usize,
        max_depth: usize,
        constraints: &TraversalConstraints,
    ) -> Result<Vec<TraversalPath>> {
        if min_depth > max_depth {
            return Err(ThemisError::invalid("min_depth > max_depth"));
        }
        if constraints.forbidden_vertices.contains(&start.uuid)
            || !self.vertex_passes(start, constraints)?
        {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut visited_vertices: HashSet<Uuid> = HashSet::new();
        let mut visited_edges: HashSet<Uuid> = HashSet::new();
        let mut expanded_edges = 0usize;

        let mut queue: VecDeque<TraversalPath> = VecDeque::new();
        queue.push_back(TraversalPath {
            vertices: vec![start.clone()],
            edges: Vec::new(),
            cost: 0.0,
        });
        visited_vertices.insert(start.uuid);

        while let Some(path) = queue.pop_front() {
            let depth = path.edges.len();
            if depth >= min_depth {
                paths.push(path.clone());
            }
            if depth == max_depth {
                continue;
            }

            let tail = path.vertices.last().expect("path never empty");
            let hops = neighbors(
                self.view,
                tail.uuid,
                true,
                constraints.edge_type.as_deref(),
            )?;

            // Prune before expansion, in one batched load per frontier
            // vertex set.
            let candidates: Vec<&Neighbor> = hops
                .iter()
                .filter(|n| !constraints.forbidden_edges.contains(&n.edge))
                .filter(|n| !constraints.forbidden_vertices.contains(&n.other.uuid))
                .filter(|n| !(constraints.unique_edges && visited_edges.contains(&n.edge)))
                .filter(|n| !(constraints.unique_vertices && visited_vertices.contains(&n.other.uuid)))
                .collect();

            let passing = self.filter_spatial(
                candidates.iter().map(|n| n.other.clone()).collect(),
                constraints,
            )?;

            for hop in candidates {
                if !passing.contains(&hop.other.uuid) {
                    continue;
                }
                expanded_edges += 1;
                if let Some(budget) = constraints.max_edges {
                    if expanded_edges > budget {
                        return Err(ThemisError::CycleBudget(budget));
                    }
                }
                if constraints.unique_edges {
                    visited_edges.insert(hop.edge);
                }
                if constraints.unique_vertices {
                    visited_vertices.insert(hop.other.uuid);
                }
                let mut next = path.clone();
                next.vertices.push(hop.other.clone());
                next.edges.push(hop.edge_urn.clone());
                next.cost += 1.0;
                queue.push_back(next);
            }
        }
        Ok(paths)
    }

    /// Dijkstra shortest path with non-negative edge weights read from
    /// `weight_field` on the edge entity (missing field = 1.0).
    pub fn shortest_path(
        &self,
        start: &Urn,
        goal: &Urn,
        weight_field: Option<&str>,
        constraints: &TraversalConstraints,
    ) -> Result<Option<TraversalPath>> {
        if !self.vertex_passes(start, constraints)? || !self.vertex_passes(goal, constraints)? {
            return Ok(None);
        }

        #[derive(PartialEq)]
        struct QueueEntry {
            cost: f64,
            path: TraversalPath,
        }
        impl Eq for QueueEntry {}
        impl Ord for QueueEntry {
            fn cmp(&self, other: &Self) -> Ordering {
                // Min-heap by cost.
                other
                    .cost
                    .partial_cmp(&self.cost)
                    .unwrap_or(Ordering::Equal)
            }
        }
        impl PartialOrd for QueueEntry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut best: HashMap<Uuid, f64> = HashMap::new();
        let mut expanded_edges = 0usize;
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry {
            cost: 0.0,
            path: TraversalPath { vertices: vec![start.clone()], edges: Vec::new(), cost: 0.0 },
        });
        best.insert(start.uuid, 0.0);

        while let Some(QueueEntry { cost, path }) = heap.pop() {
            let tail = path.vertices.last().expect("path never empty");
            if tail.uuid == goal.uuid {
                return Ok(Some(path));
            }
            if best.get(&tail.uuid).is_some_and(|&b| cost > b) {
                continue;
            }

            let hops = neighbors(
                self.view,
                tail.uuid,
                true,
                constraints.edge_type.as_deref(),
            )?;
            let candidates: Vec<&Neighbor> = hops
                .iter()
                .filter(|n| !constraints.forbidden_edges.contains(&n.edge))
                .filter(|n| !constraints.forbidden_vertices.contains(&n.other.uuid))
                .collect();

            let passing = self.filter_spatial(
                candidates.iter().map(|n| n.other.clone()).collect(),
                constraints,
            )?;
            let weights = self.load_weights(
                candidates.iter().map(|n| n.edge_urn.clone()).collect(),
                weight_field,
            )?;

            for hop in candidates {
                if !passing.contains(&hop.other.uuid) {
                    continue;
                }
                expanded_edges += 1;
                if let Some(budget) = constraints.max_edges {
                    if expanded_edges > budget {
                        return Err(ThemisError::CycleBudget(budget));
                    }
                }
                let weight = weights.get(&hop.edge).copied().unwrap_or(1.0);
                if weight < 0.0 {
                    return Err(ThemisError::invalid(format!(
                        "negative edge weight on {}",
                        hop.edge_urn
                    )));
                }
                let next_cost = cost + weight;
                if best
                    .get(&hop.other.uuid)
                    .is_none_or(|&b| next_cost < b)
                {
                    best.insert(hop.other.uuid, next_cost);
                    let mut next = path.clone();
                    next.vertices.push(hop.other.clone());
                    next.edges.push(hop.edge_urn.clone());
                    next.cost = next_cost;
                    heap.push(QueueEntry { cost: next_cost, path: next });
                }
            }
        }
        Ok(None)
    }

    /// Batched entity load, grouped per collection.
    pub fn load_vertices(&self, urns: &[Urn]) -> Result<HashMap<Uuid, Entity>> {
        let mut by_collection: HashMap<&str, Vec<&Urn>> = HashMap::new();
        for urn in urns {
            by_collection.entry(&urn.collection).or_default().push(urn);
        }
        let mut out = HashMap::new();
        for (collection, group) in by_collection {
            let table = self.descriptors.load(collection)?.fields;
            let keys: Vec<Vec<u8>> = group
                .iter()
                .map(|u| entity_key(collection, u.uuid))
                .collect();
            let blobs = self.view.multi_get(CF_ENTITY, &keys)?;
            for (urn, blob) in group.iter().zip(blobs) {
                if let Some(blob) = blob {
                    out.insert(urn.uuid, codec::decode(&blob, &table)?);
                }
            }
        }
        Ok(out)
    }

    /// Which of the given vertices pass the spatial filter. Without a
    /// filter, all of them (no loads at all).
    fn filter_spatial(
        &self,
        urns: Vec<Urn>,
        constraints: &TraversalConstraints,
    ) -> Result<HashSet<Uuid>> {
        let Some(filter) = &constraints.spatial_filter else {
            return Ok(urns.into_iter().map(|u| u.uuid).collect());
        };
        let loaded = self.load_vertices(&urns)?;
        let mut passing = HashSet::new();
        for urn in &urns {
            if let Some(entity) = loaded.get(&urn.uuid) {
                if entity_matches_spatial(entity, filter)? {
                    passing.insert(urn.uuid);
                }
            }
        }
        Ok(passing)
    }

    fn vertex_passes(&self, urn: &Urn, constraints: &TraversalConstraints) -> Result<bool> {
        if constraints.spatial_filter.is_none() {
            return Ok(true);
        }
        Ok(self
            .filter_spatial(vec![urn.clone()], constraints)?
            .contains(&urn.uuid))
    }

    fn load_weights(
        &self,
        edge_urns: Vec<Urn>,
        weight_field: Option<&str>,
    ) -> Result<HashMap<Uuid, f64>> {
        let Some(field) = weight_field else {
            return Ok(HashMap::new());
        };
        let loaded = self.load_vertices(&edge_urns)?;
        Ok(loaded
            .into_iter()
            .filter_map(|(uuid, entity)| {
                entity.get(field).and_then(|v| v.as_float()).map(|w| (uuid, w))
            })
            .collect())
    }
}

/// Evaluate a spatial filter against one vertex entity.
pub fn entity_matches_spatial(entity: &Entity, filter: &SpatialFilter) -> Result<bool> {
    match entity.get(&filter.field) {
        Some(FieldValue::Bytes(ewkb)) => {
            let geom = Geometry::parse_ewkb(ewkb)?;
            Ok(filter.predicate.matches(&geom))
        }
        // Vertices without the field fail the filter; silence, not error.
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coord;
    use crate::graph::compute_delta;
    use crate::storage::{Storage, CF_GRAPH};
    use crate::types::{fields, DataModel};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        storage: Storage,
        descriptors: DescriptorCache,
        nodes: HashMap<&'static str, Urn>,
    }

    /// A small road graph:  A -> B -> D,  A -> C -> D (heavier),  D -> E.
    /// All nodes carry a point location; E is far away.
    fn build_graph(dir: &TempDir) -> Fixture {
        let storage = Storage::open(dir.path()).unwrap();
        let descriptors = DescriptorCache::new(storage.clone());

        let names = ["A", "B", "C", "D", "E"];
        let coords = [
            (13.0, 52.0),
            (13.2, 52.1),
            (13.1, 51.9),
            (13.4, 52.2),
            (151.2, -33.9),
        ];
        let mut nodes = HashMap::new();
        let mut table = crate::codec::FieldTable::new();
        for (name, (x, y)) in names.iter().zip(coords) {
            let urn = Urn::new(DataModel::Graph, "t", "nodes", Uuid::new_v4());
            let mut f = BTreeMap::new();
            f.insert("name".to_string(), FieldValue::Text((*name).into()));
            f.insert(
                "location".to_string(),
                FieldValue::Bytes(Geometry::Point(Coord::new(x, y)).to_ewkb()),
            );
            let entity = Entity::new(f);
            let blob = crate::codec::encode(&entity, &mut table).unwrap();
            storage
                .put(CF_ENTITY, &entity_key("nodes", urn.uuid), &blob)
                .unwrap();
            nodes.insert(*name, urn);
        }
        // Persist the field table so loads can decode.
        let mut desc = crate::storage::CollectionDescriptor::default();
        desc.fields = table.clone();
        storage
            .put(
                crate::storage::CF_META,
                &crate::storage::keys::descriptor_key("nodes"),
                &DescriptorCache::serialize(&desc).unwrap(),
            )
            .unwrap();

        let mut edge_table = crate::codec::FieldTable::new();
        let mut edge_desc = crate::storage::CollectionDescriptor::default();
        for (from, to, weight) in [
            ("A", "B", 1.0),
            ("B", "D", 1.0),
            ("A", "C", 1.0),
            ("C", "D", 5.0),
            ("D", "E", 1.0),
        ] {
            let edge_urn = Urn::new(DataModel::Graph, "t", "roads", Uuid::new_v4());
            let mut f = BTreeMap::new();
            f.insert(fields::FROM.into(), FieldValue::Text(nodes[from].to_string()));
            f.insert(fields::TO.into(), FieldValue::Text(nodes[to].to_string()));
            f.insert(fields::EDGE_TYPE.into(), FieldValue::Text("road".into()));
            f.insert("km".into(), FieldValue::Float(weight));
            let entity = Entity::new(f);
            let blob = crate::codec::encode(&entity, &mut edge_table).unwrap();
            storage
                .put(CF_ENTITY, &entity_key("roads", edge_urn.uuid), &blob)
                .unwrap();
            let delta = compute_delta(&edge_urn, None, Some(&entity)).unwrap();
            for (k, v) in &delta.puts {
                storage.put(CF_GRAPH, k, v).unwrap();
            }
        }
        edge_desc.fields = edge_table;
        storage
            .put(
                crate::storage::CF_META,
                &crate::storage::keys::descriptor_key("roads"),
                &DescriptorCache::serialize(&edge_desc).unwrap(),
            )
            .unwrap();

        Fixture { storage, descriptors, nodes }
    }

    fn europe_box() -> SpatialFilter {
        SpatialFilter {
            field: "location".into(),
            predicate: SpatialPredicate::Within(Geometry::Polygon(vec![vec![
                Coord::new(-10.0, 35.0),
                Coord::new(30.0, 35.0),
                Coord::new(30.0, 60.0),
                Coord::new(-10.0, 60.0),
                Coord::new(-10.0, 35.0),
            ]])),
        }
    }

    #[test]
    fn test_bfs_depth_window() {
        let dir = TempDir::new().unwrap();
        let fx = build_graph(&dir);
        let view = fx.storage.snapshot_view();
        let traverser = Traverser::new(&view, &fx.descriptors);

        // Depth 0..0: just the start vertex.
        let paths = traverser
            .bfs(&fx.nodes["A"], 0, 0, &TraversalConstraints::default())
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].vertices.len(), 1);

        // Depth up to 2 reaches B, C (1 hop) and D (2 hops).
        let paths = traverser
            .bfs(&fx.nodes["A"], 1, 2, &TraversalConstraints::default())
            .unwrap();
        let reached: HashSet<Uuid> = paths
            .iter()
            .map(|p| p.vertices.last().unwrap().uuid)
            .collect();
        assert!(reached.contains(&fx.nodes["B"].uuid));
        assert!(reached.contains(&fx.nodes["C"].uuid));
        assert!(reached.contains(&fx.nodes["D"].uuid));
        assert!(!reached.contains(&fx.nodes["E"].uuid));
    }

    #[test]
    fn test_bfs_spatial_pruning_blocks_expansion() {
        let dir = TempDir::new().unwrap();
        let fx = build_graph(&dir);
        let view = fx.storage.snapshot_view();
        let traverser = Traverser::new(&view, &fx.descriptors);

        let constraints = TraversalConstraints {
            spatial_filter: Some(europe_box()),
            ..Default::default()
        };
        let paths = traverser.bfs(&fx.nodes["A"], 0, 4, &constraints).unwrap();
        let reached: HashSet<Uuid> = paths
            .iter()
            .map(|p| p.vertices.last().unwrap().uuid)
            .collect();
        // E is outside the box and pruned.
        assert!(!reached.contains(&fx.nodes["E"].uuid));
        assert!(reached.contains(&fx.nodes["D"].uuid));
    }

    #[test]
    fn test_shortest_path_by_weight() {
        let dir = TempDir::new().unwrap();
        let fx = build_graph(&dir);
        let view = fx.storage.snapshot_view();
        let traverser = Traverser::new(&view, &fx.descriptors);

        let path = traverser
            .shortest_path(
                &fx.nodes["A"],
                &fx.nodes["D"],
                Some("km"),
                &TraversalConstraints::default(),
            )
            .unwrap()
            .unwrap();
        // A->B->D costs 2.0; A->C->D costs 6.0.
        let names: Vec<Uuid> = path.vertices.iter().map(|u| u.uuid).collect();
        assert_eq!(names[1], fx.nodes["B"].uuid);
        assert!((path.cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_shortest_path_respects_forbidden_vertices() {
        let dir = TempDir::new().unwrap();
        let fx = build_graph(&dir);
        let view = fx.storage.snapshot_view();
        let traverser = Traverser::new(&view, &fx.descriptors);

        let mut constraints = TraversalConstraints::default();
        constraints.forbidden_vertices.insert(fx.nodes["B"].uuid);
        let path = traverser
            .shortest_path(&fx.nodes["A"], &fx.nodes["D"], Some("km"), &constraints)
            .unwrap()
            .unwrap();
        assert_eq!(path.vertices[1].uuid, fx.nodes["C"].uuid);
        assert!((path.cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cycle_budget() {
        let dir = TempDir::new().unwrap();
        let fx = build_graph(&dir);
        let view = fx.storage.snapshot_view();
        let traverser = Traverser::new(&view, &fx.descriptors);

        let constraints = TraversalConstraints { max_edges: Some(1), ..Default::default() };
        let err = traverser.bfs(&fx.nodes["A"], 0, 3, &constraints).unwrap_err();
        assert!(matches!(err, ThemisError::CycleBudget(1)));
    }
}
