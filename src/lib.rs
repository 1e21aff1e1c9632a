//! ivfmerge - Merging and consolidation of sharded inverted-file vector indexes
//!
//! A sharded index splits its corpus across several IVF shards that share one
//! coarse quantizer and one vector codec. Each shard keeps `(identifier, code)`
//! entries in per-list posting stores, either in memory or in a memory-mapped
//! file. This crate searches such shards as one index and collapses them into a
//! single shard, either by merging pairwise into the first shard or by streaming
//! every shard's lists into one consolidated on-disk store.
//!
//! ```rust
//! use ivfmerge::{FlatCodec, FlatQuantizer, IvfShard, ShardedIndex, ShardedIndexConfig, DistanceMetric};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let quantizer = Arc::new(FlatQuantizer::from_centroids(2, DistanceMetric::L2, vec![0.0, 0.0, 5.0, 5.0])?);
//! let mut index = ShardedIndex::new(ShardedIndexConfig::new().dimension(2))?;
//! for _ in 0..2 {
//!     index.add_shard(IvfShard::new(quantizer.clone(), Arc::new(FlatCodec::new(2)))?)?;
//! }
//!
//! index.add(&[0.0, 1.0, 5.0, 4.0, 1.0, 0.0, 4.0, 5.0])?;
//! index.merge_into_first(true)?;
//! assert_eq!(index.shard_totals(), vec![4, 0]);
//! # Ok(())
//! # }
//! ```

pub mod array_store;
pub mod codec;
pub mod config;
pub mod consolidator;
pub mod constants;
pub mod distance;
pub mod error;
pub mod memory;
pub mod merger;
pub mod ondisk_store;
pub mod posting_store;
pub mod quantizer;
pub mod search_coordinator;
pub mod shard;
pub mod sharded_index;
pub mod structures;

#[cfg(test)]
pub mod test_utils;

pub use array_store::ArrayPostingStore;
pub use codec::{FlatCodec, VectorCodec};
pub use config::{OnDiskConfig, ShardedIndexConfig};
pub use consolidator::OnDiskConsolidator;
pub use distance::DistanceMetric;
pub use error::IvfError;
pub use memory::{MemoryMappedFile, StandardHeader};
pub use merger::{merge_posting_lists, ShardMerger};
pub use ondisk_store::{ListLayout, ListSlot, OnDiskPostingStore};
pub use posting_store::{check_id_shift, PostingStore, StoreKind};
pub use quantizer::{CoarseQuantizer, FlatQuantizer};
pub use search_coordinator::{merge_shard_results, TopK};
pub use shard::{IvfShard, SearchShard};
pub use sharded_index::{IndexState, ShardHandle, ShardedIndex};
pub use structures::{Idx, PostingList, SearchResults, MISSING_LABEL};

/// Type alias for Results using IvfError
pub type Result<T> = std::result::Result<T, IvfError>;
