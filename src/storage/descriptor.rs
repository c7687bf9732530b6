//! Collection descriptors.
//!
//! A descriptor records everything per-collection that must survive
//! restarts: the field-id table, the classification label, and the index
//! configuration. Persisted under the `meta` CF and cached in memory;
//! descriptor updates are staged into the same transaction as the write
//! that caused them.

use crate::audit::policy::Classification;
use crate::codec::FieldTable;
use crate::index::hnsw::DistanceMetric;
use crate::storage::column_families::CF_META;
use crate::storage::keys::descriptor_key;
use crate::storage::Storage;
use crate::types::{fields, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// HNSW configuration for one (collection, field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub field: String,
    pub dim: usize,
    pub metric: DistanceMetric,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl VectorConfig {
    /// Defaults observed at first embedding write.
    pub fn with_dim(dim: usize) -> Self {
        Self {
            field: fields::EMBEDDING.to_string(),
            dim,
            metric: DistanceMetric::L2,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Spatial index configuration for one (collection, field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialConfig {
    pub field: String,
    /// Geodetic columns use Haversine meters for ST_DWithin.
    pub geodetic: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self { field: fields::GEOMETRY.to_string(), geodetic: false }
    }
}

/// Per-collection persistent metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub fields: FieldTable,
    pub classification: Classification,
    /// URN model observed at first write, for result URN formatting
    pub urn_model: Option<crate::types::DataModel>,
    /// URN namespace observed at first write
    pub urn_namespace: Option<String>,
    /// Equality-indexed fields; `None` means every scalar field.
    pub eq_fields: Option<BTreeSet<String>>,
    /// Range-indexed fields; `None` means every scalar field.
    pub range_fields: Option<BTreeSet<String>>,
    /// Full-text indexed fields.
    pub fulltext_fields: BTreeSet<String>,
    pub vector: Option<VectorConfig>,
    pub spatial: Option<SpatialConfig>,
}

impl Default for CollectionDescriptor {
    fn default() -> Self {
        let mut fulltext = BTreeSet::new();
        fulltext.insert(fields::TEXT_CONTENT.to_string());
        Self {
            fields: FieldTable::new(),
            classification: Classification::Offen,
            urn_model: None,
            urn_namespace: None,
            eq_fields: None,
            range_fields: None,
            fulltext_fields: fulltext,
            vector: None,
            spatial: Some(SpatialConfig::default()),
        }
    }
}

impl CollectionDescriptor {
    pub fn eq_indexes_field(&self, name: &str) -> bool {
        match &self.eq_fields {
            Some(set) => set.contains(name),
            None => true,
        }
    }

    pub fn range_indexes_field(&self, name: &str) -> bool {
        match &self.range_fields {
            Some(set) => set.contains(name),
            None => true,
        }
    }

    pub fn fulltext_indexes_field(&self, name: &str) -> bool {
        self.fulltext_fields.contains(name)
    }
}

/// In-memory descriptor cache over the `meta` CF.
pub struct DescriptorCache {
    storage: Storage,
    cache: RwLock<HashMap<String, CollectionDescriptor>>,
}

impl DescriptorCache {
    pub fn new(storage: Storage) -> Self {
        Self { storage, cache: RwLock::new(HashMap::new()) }
    }

    /// Load a descriptor, creating the default lazily (not persisted until
    /// the first write stages it).
    pub fn load(&self, collection: &str) -> Result<CollectionDescriptor> {
        if let Some(desc) = self.cache.read().unwrap().get(collection) {
            return Ok(desc.clone());
        }
        let desc = match self.storage.get(CF_META, &descriptor_key(collection))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => CollectionDescriptor::default(),
        };
        self.cache
            .write()
            .unwrap()
            .insert(collection.to_string(), desc.clone());
        Ok(desc)
    }

    /// Install an updated descriptor in the cache after its transaction
    /// committed.
    pub fn install(&self, collection: &str, desc: CollectionDescriptor) {
        self.cache
            .write()
            .unwrap()
            .insert(collection.to_string(), desc);
    }

    /// Drop a cached entry (rollback path).
    pub fn evict(&self, collection: &str) {
        self.cache.write().unwrap().remove(collection);
    }

    /// Serialized descriptor bytes for staging into a transaction.
    pub fn serialize(desc: &CollectionDescriptor) -> Result<Vec<u8>> {
        Ok(bincode::serialize(desc)?)
    }
}
