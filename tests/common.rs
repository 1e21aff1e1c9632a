//! Common test utilities for integration tests
//!
//! This module provides shared utilities for integration tests that cannot
//! access the main crate's test_utils module.

use ivfmerge::{
    CoarseQuantizer, DistanceMetric, FlatCodec, FlatQuantizer, Idx, IvfError, IvfShard, PostingList, PostingStore,
    SearchResults, SearchShard, ShardedIndex, ShardedIndexConfig,
};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;

/// Test constants for consistent test configuration across integration tests
pub mod test_constants {
    pub const DIMENSION: usize = 64;
    pub const NB: usize = 1000;
    pub const NQ: usize = 100;
    pub const NSHARDS: usize = 4;
    pub const NLIST: usize = 40;
    pub const NPROBE: usize = 10;
    pub const K: usize = 10;
    pub const SEED: u64 = 1234;
}

/// Error messages for consistent test error reporting
pub mod test_error_messages {
    pub const FAILED_TO_CREATE_TEMP_DIR: &str = "Failed to create test temporary directory";
    #[allow(dead_code)]
    pub const FAILED_TO_CREATE_INDEX: &str = "Failed to create test index";
}

/// Creates a temporary directory for test use with proper error handling
#[allow(dead_code)]
pub fn create_temp_dir_for_test() -> TempDir {
    TempDir::new().expect(test_error_messages::FAILED_TO_CREATE_TEMP_DIR)
}

/// Database, queries and a quantizer trained on a sample of the database
#[allow(dead_code)]
pub struct Scenario {
    pub dimension: usize,
    pub nb: usize,
    pub nq: usize,
    pub nshards: usize,
    pub k: usize,
    pub metric: DistanceMetric,
    pub xb: Vec<f32>,
    pub xq: Vec<f32>,
    pub quantizer: Arc<dyn CoarseQuantizer>,
}

#[allow(dead_code)]
impl Scenario {
    /// Four shards of 250 vectors each, `nlist = 40`, `k = 10`, 100 queries
    pub fn standard() -> Self {
        Self::with_metric(DistanceMetric::L2)
    }

    pub fn with_metric(metric: DistanceMetric) -> Self {
        use test_constants::*;
        let mut rng = StdRng::seed_from_u64(SEED);
        let xb: Vec<f32> = (0..NB * DIMENSION).map(|_| rng.gen::<f32>()).collect();
        let xq: Vec<f32> = (0..NQ * DIMENSION).map(|_| rng.gen::<f32>()).collect();

        // Centroids are a strided sample of the database
        let stride = NB / NLIST;
        let centroids: Vec<f32> = (0..NLIST)
            .flat_map(|c| xb[c * stride * DIMENSION..(c * stride + 1) * DIMENSION].iter().copied())
            .collect();
        let quantizer = FlatQuantizer::from_centroids(DIMENSION, metric, centroids).expect("quantizer");

        Self {
            dimension: DIMENSION,
            nb: NB,
            nq: NQ,
            nshards: NSHARDS,
            k: K,
            metric,
            xb,
            xq,
            quantizer: Arc::new(quantizer),
        }
    }

    /// Empty trained shard over the shared quantizer
    pub fn shard(&self) -> IvfShard {
        let mut shard = IvfShard::new(Arc::clone(&self.quantizer), Arc::new(FlatCodec::new(self.dimension))).expect("shard");
        shard.set_nprobe(test_constants::NPROBE).expect("nprobe");
        shard
    }

    pub fn config(&self, successive_ids: bool) -> ShardedIndexConfig {
        ShardedIndexConfig::new()
            .dimension(self.dimension)
            .metric(self.metric)
            .successive_ids(successive_ids)
    }

    /// Index with `nshards` empty shards
    pub fn index(&self, successive_ids: bool) -> ShardedIndex {
        let mut index = ShardedIndex::new(self.config(successive_ids)).expect("index");
        for _ in 0..self.nshards {
            index.add_shard(self.shard()).expect("add shard");
        }
        index
    }

    /// Index over caller-held shard handles
    pub fn index_with(&self, shards: &[Arc<RwLock<IvfShard>>], successive_ids: bool) -> ShardedIndex {
        let mut index = ShardedIndex::new(self.config(successive_ids)).expect("index");
        for shard in shards {
            index.add_shared_shard(Arc::clone(shard)).expect("add shared shard");
        }
        index
    }

    /// Sparse explicit identifiers `123 + 456 * i`
    pub fn sparse_ids(&self) -> Vec<Idx> {
        (0..self.nb as Idx).map(|i| 123 + 456 * i).collect()
    }

    /// Single shard holding the whole database under `ids`
    pub fn reference(&self, ids: &[Idx]) -> IvfShard {
        let mut shard = self.shard();
        shard.add_with_ids(&self.xb, Some(ids)).expect("reference add");
        shard
    }

    pub fn search_reference(&self, ids: &[Idx]) -> SearchResults {
        self.reference(ids).search(&self.xq, self.k).expect("reference search")
    }

    /// Row of the database stored under position `i`
    pub fn vector(&self, i: usize) -> &[f32] {
        &self.xb[i * self.dimension..(i + 1) * self.dimension]
    }
}

/// Number of result slots whose labels differ
#[allow(dead_code)]
pub fn count_mismatches(a: &SearchResults, b: &SearchResults) -> usize {
    assert_eq!(a.labels.len(), b.labels.len());
    a.labels.iter().zip(&b.labels).filter(|(x, y)| x != y).count()
}

/// Every list of `store`, materialized
#[allow(dead_code)]
pub fn snapshot(store: &dyn PostingStore) -> Result<Vec<PostingList>, IvfError> {
    (0..store.nlist()).map(|list_no| store.read_list(list_no)).collect()
}
