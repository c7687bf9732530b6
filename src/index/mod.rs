//! Index projections: secondary/range, full-text, vector (HNSW), spatial
//! (Morton), time-series buckets. All but the HNSW live in the KV engine
//! and mutate inside the owning transaction; the HNSW is fed by the
//! intent WAL.

pub mod fulltext;
pub mod hnsw;
pub mod secondary;
pub mod spatial;
pub mod timeseries;
pub mod vector;

pub use hnsw::{DistanceMetric, HnswIndex, HnswParams};
pub use vector::{VectorIndexRegistry, VectorIntent};
