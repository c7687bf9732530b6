//! Column family constants and setup.
//!
//! All index projections live in the same RocksDB instance under distinct
//! column families; they are not separate storage systems.

use rocksdb::{BlockBasedOptions, ColumnFamilyDescriptor, Options};

/// Primary entity blobs
pub const CF_ENTITY: &str = "entity";

/// Secondary equality index
pub const CF_IDX_EQ: &str = "idx_eq";

/// Range index (order-preserving value encoding)
pub const CF_IDX_RANGE: &str = "idx_range";

/// Full-text inverted index + BM25 sidecars
pub const CF_IDX_FT: &str = "idx_ft";

/// Graph adjacency (forward and reverse)
pub const CF_GRAPH: &str = "graph";

/// Spatial Morton index
pub const CF_IDX_SPATIAL: &str = "idx_spatial";

/// Time-series buckets (Gorilla-compressed)
pub const CF_TS: &str = "ts";

/// Vector intent log (HNSW mutations pending background apply)
pub const CF_VECTOR_WAL: &str = "vector_wal";

/// Sealed audit records
pub const CF_AUDIT: &str = "audit";

/// PII pseudonym → original value mapping (role-gated)
pub const CF_PII_MAP: &str = "pii_map";

/// Collection descriptors, counters, watermarks
pub const CF_META: &str = "meta";

/// All column family names, in open order.
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        CF_ENTITY,
        CF_IDX_EQ,
        CF_IDX_RANGE,
        CF_IDX_FT,
        CF_GRAPH,
        CF_IDX_SPATIAL,
        CF_TS,
        CF_VECTOR_WAL,
        CF_AUDIT,
        CF_PII_MAP,
        CF_META,
    ]
}

/// Column family descriptors with per-family tuning.
pub fn create_column_family_descriptors() -> Vec<ColumnFamilyDescriptor> {
    all_column_families()
        .into_iter()
        .map(|name| {
            let opts = match name {
                CF_ENTITY => entity_cf_options(),
                CF_IDX_EQ | CF_IDX_RANGE | CF_IDX_FT | CF_GRAPH | CF_IDX_SPATIAL => {
                    index_cf_options()
                }
                _ => Options::default(),
            };
            ColumnFamilyDescriptor::new(name, opts)
        })
        .collect()
}

/// Entity storage: compressed, bloom filter on point lookups.
fn entity_cf_options() -> Options {
    let mut opts = Options::default();
    let mut block = BlockBasedOptions::default();
    block.set_bloom_filter(10.0, false);
    opts.set_block_based_table_factory(&block);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}

/// Index families: scan-heavy, whole-key bloom off to favor prefix seeks.
fn index_cf_options() -> Options {
    let mut opts = Options::default();
    let mut block = BlockBasedOptions::default();
    block.set_bloom_filter(10.0, false);
    block.set_whole_key_filtering(false);
    opts.set_block_based_table_factory(&block);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}
