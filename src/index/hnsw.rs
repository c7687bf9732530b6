//! Hierarchical Navigable Small World index.
//!
//! In-process approximate nearest-neighbor graph, one instance per
//! (collection, field). UUIDs are the external ids; vector payloads live
//! in the entity blob and are duplicated here for search. Durable form is
//! a periodic snapshot plus the intent WAL replayed on load (see
//! `index::vector`).
//!
//! Search accepts an optional whitelist. When the whitelist is much
//! smaller than the index the graph is bypassed entirely and the
//! whitelist is brute-forced, which is both faster and exact.

use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use uuid::Uuid;

/// Whitelists at or below this size (or far below the index size) skip
/// the graph and brute-force.
const BRUTE_FORCE_ABSOLUTE: usize = 2048;

/// Distance metric for a vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    L2,
    /// Requires pre-normalized vectors
    Cosine,
    InnerProduct,
}

impl DistanceMetric {
    /// Distance between two vectors; lower is closer for every metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Self::Cosine => 1.0 - dot(a, b),
            Self::InnerProduct => -dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// HNSW build/search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswParams {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub metric: DistanceMetric,
}

impl HnswParams {
    pub fn new(dim: usize) -> Self {
        Self { dim, m: 16, ef_construction: 200, ef_search: 50, metric: DistanceMetric::L2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    uuid: Uuid,
    vector: Vec<f32>,
    /// Adjacency per layer; layer 0 is index 0
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

/// Min-heap entry ordered by distance.
#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    id: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse: BinaryHeap is a max-heap, we want nearest first.
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry for the bounded result set.
#[derive(PartialEq)]
struct Farthest {
    dist: f32,
    id: u32,
}

impl Eq for Farthest {}

impl Ord for Farthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Farthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The index. Mutated only by the single vector-apply worker; readers
/// hold the registry's read lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswIndex {
    params: HnswParams,
    nodes: Vec<Node>,
    by_uuid: HashMap<Uuid, u32>,
    entry: Option<u32>,
    max_layer: usize,
    live: usize,
}

impl HnswIndex {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            by_uuid: HashMap::new(),
            entry: None,
            max_layer: 0,
            live: 0,
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.by_uuid
            .get(&uuid)
            .map(|&id| !self.nodes[id as usize].deleted)
            .unwrap_or(false)
    }

    /// Insert or replace a vector.
    pub fn insert(&mut self, uuid: Uuid, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.params.dim {
            return Err(ThemisError::DimensionMismatch {
                expected: self.params.dim,
                actual: vector.len(),
            });
        }
        if self.by_uuid.contains_key(&uuid) {
            self.remove(uuid);
        }

        let level = self.sample_level();
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            uuid,
            vector,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.by_uuid.insert(uuid, id);
        self.live += 1;

        let Some(mut ep) = self.entry else {
            self.entry = Some(id);
            self.max_layer = level;
            return Ok(());
        };

        let query = self.nodes[id as usize].vector.clone();

        // Greedy descent through layers above the new node's level.
        let mut layer = self.max_layer;
        while layer > level {
            ep = self.greedy_closest(&query, ep, layer);
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        // Connect at each layer from min(level, max_layer) down to 0.
        let top = level.min(self.max_layer);
        for l in (0..=top).rev() {
            let found = self.search_layer(&query, &[ep], self.params.ef_construction, l);
            let m_max = if l == 0 { self.params.m * 2 } else { self.params.m };
            let selected: Vec<u32> = found.iter().take(self.params.m).map(|c| c.id).collect();

            for &n in &selected {
                self.nodes[id as usize].neighbors[l].push(n);
                self.nodes[n as usize].neighbors[l].push(id);
                self.prune_neighbors(n, l, m_max);
            }
            if let Some(best) = found.first() {
                ep = best.id;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry = Some(id);
        }
        Ok(())
    }

    /// Tombstone a vector. Edges stay; searches skip deleted nodes.
    pub fn remove(&mut self, uuid: Uuid) -> bool {
        let Some(&id) = self.by_uuid.get(&uuid) else {
            return false;
        };
        let node = &mut self.nodes[id as usize];
        if node.deleted {
            return false;
        }
        node.deleted = true;
        self.live -= 1;
        self.by_uuid.remove(&uuid);

        // Move the entry point off a tombstone.
        if self.entry == Some(id) {
            self.entry = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| !n.deleted)
                .max_by_key(|(_, n)| n.neighbors.len())
                .map(|(i, _)| i as u32);
            self.max_layer = self
                .entry
                .map(|e| self.nodes[e as usize].neighbors.len() - 1)
                .unwrap_or(0);
        }
        true
    }

    /// Top-k nearest neighbors of `query`.
    ///
    /// With a whitelist, only whitelisted UUIDs are returned; an empty
    /// whitelist yields an empty result, not an error. `ef` overrides the
    /// configured `ef_search` when given.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        whitelist: Option<&HashSet<Uuid>>,
    ) -> Result<Vec<(Uuid, f32)>> {
        if query.len() != self.params.dim {
            return Err(ThemisError::DimensionMismatch {
                expected: self.params.dim,
                actual: query.len(),
            });
        }
        if k == 0 || self.live == 0 {
            return Ok(Vec::new());
        }
        if let Some(wl) = whitelist {
            if wl.is_empty() {
                return Ok(Vec::new());
            }
            if wl.len() <= BRUTE_FORCE_ABSOLUTE || wl.len() * 10 < self.live {
                return Ok(self.brute_force(query, k, wl));
            }
        }

        let Some(mut ep) = self.entry else {
            return Ok(Vec::new());
        };
        let ef = ef.unwrap_or(self.params.ef_search).max(k);

        for layer in (1..=self.max_layer).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }

        let found = self.search_layer_filtered(query, &[ep], ef, 0, whitelist);
        Ok(found
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.id as usize].uuid, c.dist))
            .collect())
    }

    fn brute_force(&self, query: &[f32], k: usize, whitelist: &HashSet<Uuid>) -> Vec<(Uuid, f32)> {
        use rayon::prelude::*;
        let members: Vec<Uuid> = whitelist.iter().copied().collect();
        let mut hits: Vec<(Uuid, f32)> = members
            .par_iter()
            .filter_map(|uuid| {
                self.by_uuid.get(uuid).and_then(|&id| {
                    let node = &self.nodes[id as usize];
                    if node.deleted {
                        None
                    } else {
                        Some((*uuid, self.params.metric.distance(query, &node.vector)))
                    }
                })
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        hits
    }

    /// Single-step greedy descent at one layer.
    fn greedy_closest(&self, query: &[f32], mut current: u32, layer: usize) -> u32 {
        let mut current_dist = self
            .params
            .metric
            .distance(query, &self.nodes[current as usize].vector);
        loop {
            let mut improved = false;
            let neighbors = self.layer_neighbors(current, layer).to_vec();
            for n in neighbors {
                let d = self
                    .params
                    .metric
                    .distance(query, &self.nodes[n as usize].vector);
                if d < current_dist {
                    current = n;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    fn layer_neighbors(&self, id: u32, layer: usize) -> &[u32] {
        let node = &self.nodes[id as usize];
        node.neighbors
            .get(layer)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Beam search at one layer, unfiltered (used by insert).
    fn search_layer(&self, query: &[f32], entries: &[u32], ef: usize, layer: usize) -> Vec<Candidate> {
        self.search_layer_filtered(query, entries, ef, layer, None)
    }

    /// Beam search that expands every node but only *collects* nodes that
    /// pass the filter and are not tombstoned.
    fn search_layer_filtered(
        &self,
        query: &[f32],
        entries: &[u32],
        ef: usize,
        layer: usize,
        whitelist: Option<&HashSet<Uuid>>,
    ) -> Vec<Candidate> {
        let passes = |id: u32| -> bool {
            let node = &self.nodes[id as usize];
            if node.deleted {
                return false;
            }
            whitelist.map(|wl| wl.contains(&node.uuid)).unwrap_or(true)
        };

        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut results: BinaryHeap<Farthest> = BinaryHeap::new();

        for &e in entries {
            let d = self
                .params
                .metric
                .distance(query, &self.nodes[e as usize].vector);
            visited.insert(e);
            candidates.push(Candidate { dist: d, id: e });
            if passes(e) {
                results.push(Farthest { dist: d, id: e });
            }
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map(|f| f.dist).unwrap_or(f32::INFINITY);
            if current.dist > worst && results.len() >= ef {
                break;
            }
            for &n in self.layer_neighbors(current.id, layer) {
                if !visited.insert(n) {
                    continue;
                }
                let d = self
                    .params
                    .metric
                    .distance(query, &self.nodes[n as usize].vector);
                let worst = results.peek().map(|f| f.dist).unwrap_or(f32::INFINITY);
                if results.len() < ef || d < worst {
                    candidates.push(Candidate { dist: d, id: n });
                    if passes(n) {
                        results.push(Farthest { dist: d, id: n });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results
            .into_iter()
            .map(|f| Candidate { dist: f.dist, id: f.id })
            .collect();
        out.sort_by(|a, b| a.dist.partial_cmp(&b.dist).unwrap_or(Ordering::Equal));
        out
    }

    /// Keep only the `m_max` closest neighbors of a node at a layer.
    fn prune_neighbors(&mut self, id: u32, layer: usize, m_max: usize) {
        let node_vec = self.nodes[id as usize].vector.clone();
        let neighbors = self.nodes[id as usize].neighbors[layer].clone();
        if neighbors.len() <= m_max {
            return;
        }
        let mut scored: Vec<(f32, u32)> = neighbors
            .into_iter()
            .map(|n| {
                (
                    self.params
                        .metric
                        .distance(&node_vec, &self.nodes[n as usize].vector),
                    n,
                )
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        scored.truncate(m_max);
        self.nodes[id as usize].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
    }

    /// Geometric level sampling with base 1/ln(M).
    fn sample_level(&self) -> usize {
        use rand::Rng;
        let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        let ml = 1.0 / (self.params.m as f64).ln();
        ((-u.ln()) * ml).floor() as usize
    }

    /// Serialize the whole index for the durability snapshot.
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Restore from a durability snapshot.
    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_index(n: usize, dim: usize) -> (HnswIndex, Vec<(Uuid, Vec<f32>)>) {
        let mut index = HnswIndex::new(HnswParams::new(dim));
        let mut data = Vec::new();
        for i in 0..n {
            let uuid = Uuid::new_v4();
            let vec: Vec<f32> = (0..dim)
                .map(|d| ((i * 31 + d * 7) % 97) as f32 / 97.0)
                .collect();
            index.insert(uuid, vec.clone()).unwrap();
            data.push((uuid, vec));
        }
        (index, data)
    }

    fn brute_top1(data: &[(Uuid, Vec<f32>)], query: &[f32]) -> Uuid {
        data.iter()
            .min_by(|a, b| {
                DistanceMetric::L2
                    .distance(query, &a.1)
                    .partial_cmp(&DistanceMetric::L2.distance(query, &b.1))
                    .unwrap()
            })
            .unwrap()
            .0
    }

    #[test]
    fn test_insert_and_exact_match_search() {
        let (index, data) = build_index(200, 8);
        let (uuid, vec) = &data[42];
        let hits = index.search(vec, 1, None, None).unwrap();
        assert_eq!(hits[0].0, *uuid);
        assert!(hits[0].1 < 1e-6);
    }

    #[test]
    fn test_search_matches_brute_force_top1() {
        let (index, data) = build_index(300, 8);
        let query: Vec<f32> = (0..8).map(|d| (d as f32) / 10.0).collect();
        let hits = index.search(&query, 5, Some(100), None).unwrap();
        assert_eq!(hits[0].0, brute_top1(&data, &query));
        // Results sorted by distance ascending.
        for w in hits.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let (index, _) = build_index(10, 8);
        assert!(matches!(
            index.search(&[0.0; 4], 1, None, None),
            Err(ThemisError::DimensionMismatch { expected: 8, actual: 4 })
        ));
        let mut index = index;
        assert!(index.insert(Uuid::new_v4(), vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_empty_whitelist_returns_empty() {
        let (index, _) = build_index(50, 4);
        let wl = HashSet::new();
        let hits = index.search(&[0.1; 4], 10, None, Some(&wl)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_whitelist_restricts_results_exactly() {
        let (index, data) = build_index(400, 8);
        let wl: HashSet<Uuid> = data.iter().skip(100).take(40).map(|(u, _)| *u).collect();
        let query: Vec<f32> = (0..8).map(|d| (d as f32) / 5.0).collect();
        let hits = index.search(&query, 10, None, Some(&wl)).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|(u, _)| wl.contains(u)));

        // Small whitelist takes the brute-force path: exact vs oracle.
        let subset: Vec<_> = data
            .iter()
            .filter(|(u, _)| wl.contains(u))
            .cloned()
            .collect();
        assert_eq!(hits[0].0, brute_top1(&subset, &query));
    }

    #[test]
    fn test_remove_tombstones_vector() {
        let (mut index, data) = build_index(100, 4);
        let (victim, vec) = data[7].clone();
        assert!(index.remove(victim));
        assert!(!index.contains(victim));
        assert_eq!(index.len(), 99);
        let hits = index.search(&vec, 5, Some(50), None).unwrap();
        assert!(hits.iter().all(|(u, _)| *u != victim));
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut index = HnswIndex::new(HnswParams::new(2));
        let uuid = Uuid::new_v4();
        index.insert(uuid, vec![0.0, 0.0]).unwrap();
        index.insert(uuid, vec![1.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.search(&[1.0, 1.0], 1, None, None).unwrap();
        assert_eq!(hits[0].0, uuid);
        assert!(hits[0].1 < 1e-6);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (index, data) = build_index(80, 4);
        let bytes = index.to_snapshot_bytes().unwrap();
        let restored = HnswIndex::from_snapshot_bytes(&bytes).unwrap();
        assert_eq!(restored.len(), index.len());
        let (uuid, vec) = &data[3];
        let hits = restored.search(vec, 1, None, None).unwrap();
        assert_eq!(hits[0].0, *uuid);
    }

    #[test]
    fn test_cosine_metric_on_normalized_vectors() {
        let mut index = HnswIndex::new(HnswParams {
            metric: DistanceMetric::Cosine,
            ..HnswParams::new(2)
        });
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.insert(a, vec![1.0, 0.0]).unwrap();
        index.insert(b, vec![0.0, 1.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 2, None, None).unwrap();
        assert_eq!(hits[0].0, a);
        assert!(hits[0].1 < 1e-6);
        assert!((hits[1].1 - 1.0).abs() < 1e-6);
    }
}
