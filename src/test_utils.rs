//! Test utilities for ivfmerge testing
//!
//! This module provides common utilities and helpers for unit tests, including
//! RAII-based temporary directory management, seeded vector generation, a store
//! that runs out of space on demand, and a builder that assembles trained
//! sharded indexes with standard parameters.

use crate::array_store::ArrayPostingStore;
use crate::codec::FlatCodec;
use crate::config::ShardedIndexConfig;
use crate::distance::DistanceMetric;
use crate::error::IvfError;
use crate::posting_store::{PostingStore, StoreKind};
use crate::quantizer::{CoarseQuantizer, FlatQuantizer};
use crate::shard::IvfShard;
use crate::sharded_index::ShardedIndex;
use crate::structures::Idx;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// RAII-based test environment for isolated testing
///
/// Each test gets its own temporary directory, removed when the environment
/// is dropped.
///
/// # Usage
///
/// ```ignore
/// use ivfmerge::test_utils::TestEnvironment;
///
/// fn my_test() {
///     let test_env = TestEnvironment::new("my_test");
///     let path = test_env.path().join("lists.ivf");
/// }
/// ```
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub test_name: String,
}

impl TestEnvironment {
    /// Create a new test environment with the given test name
    ///
    /// # Panics
    /// Panics if unable to create temporary directory
    pub fn new(test_name: &str) -> Self {
        let temp_dir = TempDir::new()
            .unwrap_or_else(|e| panic!("Failed to create temp dir for test {}: {}", test_name, e));

        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    /// Get the path to the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Test constants to eliminate magic numbers across test suite
pub mod test_constants {
    pub const DEFAULT_DIMENSION: usize = 16;
    pub const DEFAULT_NLIST: usize = 8;
    pub const DEFAULT_NSHARDS: usize = 4;
    pub const DEFAULT_SEED: u64 = 1234;
}

/// `n` row-major vectors of `dimension` uniform values in `[0, 1)`
pub fn random_vectors(n: usize, dimension: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dimension).map(|_| rng.gen::<f32>()).collect()
}

/// Flat quantizer whose centroids are the first `nlist` rows of `data`
pub fn sampled_quantizer(data: &[f32], dimension: usize, nlist: usize, metric: DistanceMetric) -> Arc<dyn CoarseQuantizer> {
    let centroids = data[..nlist * dimension].to_vec();
    let quantizer = FlatQuantizer::from_centroids(dimension, metric, centroids)
        .unwrap_or_else(|e| panic!("Failed to build test quantizer: {}", e));
    Arc::new(quantizer)
}

/// In-memory store that fails with a "disk full" I/O error once `budget` entries were appended
///
/// A batch that does not fit is refused whole, so earlier batches of the same
/// operation stay appended.
#[derive(Debug)]
pub struct FailingStore {
    inner: ArrayPostingStore,
    budget: usize,
}

impl FailingStore {
    pub fn new(nlist: usize, code_size: usize, budget: usize) -> Self {
        Self {
            inner: ArrayPostingStore::new(nlist, code_size),
            budget,
        }
    }

    fn charge(&mut self, entries: usize) -> Result<(), IvfError> {
        if entries > self.budget {
            return Err(IvfError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        self.budget -= entries;
        Ok(())
    }
}

impl PostingStore for FailingStore {
    fn nlist(&self) -> usize {
        self.inner.nlist()
    }

    fn code_size(&self) -> usize {
        self.inner.code_size()
    }

    fn list_len(&self, list_no: usize) -> Result<usize, IvfError> {
        self.inner.list_len(list_no)
    }

    fn entry_id(&self, list_no: usize, offset: usize) -> Result<Idx, IvfError> {
        self.inner.entry_id(list_no, offset)
    }

    fn entry_code(&self, list_no: usize, offset: usize) -> Result<&[u8], IvfError> {
        self.inner.entry_code(list_no, offset)
    }

    fn append_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize, IvfError> {
        self.charge(1)?;
        self.inner.append_entry(list_no, id, code)
    }

    fn append_entries(&mut self, list_no: usize, ids: &[Idx], codes: &[u8]) -> Result<usize, IvfError> {
        self.charge(ids.len())?;
        self.inner.append_entries(list_no, ids, codes)
    }

    fn truncate_list(&mut self, list_no: usize, len: usize) -> Result<(), IvfError> {
        self.inner.truncate_list(list_no, len)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::InMemory
    }

    fn release(self: Box<Self>) -> Result<(), IvfError> {
        Box::new(self.inner).release()
    }
}

/// Builder for trained sharded indexes sharing one quantizer
pub struct TestSetupBuilder {
    test_name: String,
    dimension: usize,
    nlist: usize,
    nshards: usize,
    successive_ids: bool,
    seed: u64,
}

impl TestSetupBuilder {
    pub fn new(test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            dimension: test_constants::DEFAULT_DIMENSION,
            nlist: test_constants::DEFAULT_NLIST,
            nshards: test_constants::DEFAULT_NSHARDS,
            successive_ids: true,
            seed: test_constants::DEFAULT_SEED,
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = nlist;
        self
    }

    pub fn with_shards(mut self, nshards: usize) -> Self {
        self.nshards = nshards;
        self
    }

    pub fn with_successive_ids(mut self, enabled: bool) -> Self {
        self.successive_ids = enabled;
        self
    }

    /// Build the environment and an empty index with `nshards` trained shards
    pub fn build_with_index(self) -> Result<(TestEnvironment, ShardedIndex), IvfError> {
        let test_env = TestEnvironment::new(&self.test_name);
        let sample = random_vectors(self.nlist, self.dimension, self.seed);
        let quantizer = sampled_quantizer(&sample, self.dimension, self.nlist, DistanceMetric::L2);

        let config = ShardedIndexConfig::new()
            .dimension(self.dimension)
            .successive_ids(self.successive_ids);
        let mut index = ShardedIndex::new(config)?;
        for _ in 0..self.nshards {
            let shard = IvfShard::new(Arc::clone(&quantizer), Arc::new(FlatCodec::new(self.dimension)))?;
            index.add_shard(shard)?;
        }
        Ok((test_env, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creation() {
        let test_env = TestEnvironment::new("test_environment_creation");

        assert_eq!(test_env.test_name, "test_environment_creation");
        assert!(test_env.path().exists());
        assert!(test_env.path().is_dir());
    }

    #[test]
    fn test_failing_store_budget() {
        let mut store = FailingStore::new(2, 1, 3);
        store.append_entries(0, &[1, 2], &[1, 2]).unwrap();
        assert!(matches!(store.append_entries(1, &[3, 4], &[3, 4]), Err(IvfError::Io(_))));
        store.append_entry(1, 3, &[3]).unwrap();
        assert!(store.append_entry(1, 4, &[4]).is_err());
        assert_eq!(store.total_entries(), 3);
    }

    #[test]
    fn test_random_vectors_are_seeded() {
        assert_eq!(random_vectors(3, 4, 7), random_vectors(3, 4, 7));
        assert_ne!(random_vectors(3, 4, 7), random_vectors(3, 4, 8));
        assert_eq!(random_vectors(3, 4, 7).len(), 12);
    }

    #[test]
    fn test_setup_builder() {
        let (_env, index) = TestSetupBuilder::new("test_setup_builder")
            .with_dimension(4)
            .with_nlist(3)
            .with_shards(2)
            .build_with_index()
            .unwrap();

        assert_eq!(index.nshards(), 2);
        assert!(index.is_trained());
        assert_eq!(index.config().dimension, 4);
    }
}
