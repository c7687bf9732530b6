//! Storage layer: RocksDB wrapper, column families, key codecs,
//! collection descriptors.

pub mod column_families;
pub mod db;
pub mod descriptor;
pub mod keys;

pub use column_families::*;
pub use db::{SnapshotView, Storage, SCAN_BATCH_SIZE};
pub use descriptor::{CollectionDescriptor, DescriptorCache, SpatialConfig, VectorConfig};
