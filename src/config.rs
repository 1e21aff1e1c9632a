//! Configuration structures
//!
//! Builder-style configuration for the sharded index and the file-backed posting
//! store. Every setter consumes and returns the config; `build()` validates.

use crate::constants::layout;
use crate::distance::DistanceMetric;
use crate::error::IvfError;
use serde::{Deserialize, Serialize};

/// Growth policy of [`crate::ondisk_store::OnDiskPostingStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDiskConfig {
    /// Entries reserved for a list on its first append
    pub initial_list_capacity: usize,
    /// Minimum number of bytes the file grows by when it runs out of room
    pub min_file_growth: usize,
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        Self {
            initial_list_capacity: layout::DEFAULT_INITIAL_LIST_CAPACITY,
            min_file_growth: layout::MIN_FILE_GROWTH,
        }
    }
}

impl OnDiskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_list_capacity(mut self, capacity: usize) -> Self {
        self.initial_list_capacity = capacity;
        self
    }

    pub fn min_file_growth(mut self, bytes: usize) -> Self {
        self.min_file_growth = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), IvfError> {
        if self.initial_list_capacity == 0 {
            return Err(IvfError::config_error(
                "on_disk.initial_list_capacity",
                "must be greater than 0",
                "Set initial_list_capacity to a positive number of entries (default: 16)",
            ));
        }

        if self.min_file_growth < layout::DATA_ALIGNMENT {
            return Err(IvfError::config_error(
                "on_disk.min_file_growth",
                format!("{} bytes is below the {} byte region alignment", self.min_file_growth, layout::DATA_ALIGNMENT),
                "Set min_file_growth to at least 64 bytes (default: 64 KiB)",
            ));
        }

        Ok(())
    }

    pub fn build(self) -> Result<Self, IvfError> {
        self.validate()?;
        Ok(self)
    }
}

/// Configuration of a [`crate::sharded_index::ShardedIndex`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedIndexConfig {
    /// Vector dimension shared by every shard
    pub dimension: usize,
    /// Metric used to rank results across shards
    pub metric: DistanceMetric,
    /// Assign global sequential identifiers on `add` instead of shard-local ones
    pub successive_ids: bool,
    /// Release shard stores when they are detached or the index is dropped
    pub own_shards: bool,
    /// Run per-shard add and search on the rayon pool
    pub parallel: bool,
    /// Growth policy for stores produced by on-disk consolidation
    pub on_disk: OnDiskConfig,
}

impl Default for ShardedIndexConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            metric: DistanceMetric::L2,
            successive_ids: true,
            own_shards: true,
            parallel: true,
            on_disk: OnDiskConfig::default(),
        }
    }
}

impl ShardedIndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the vector dimension
    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Set the ranking metric
    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn successive_ids(mut self, enabled: bool) -> Self {
        self.successive_ids = enabled;
        self
    }

    pub fn own_shards(mut self, enabled: bool) -> Self {
        self.own_shards = enabled;
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    /// Set the growth policy for consolidated on-disk stores
    pub fn on_disk(mut self, on_disk: OnDiskConfig) -> Self {
        self.on_disk = on_disk;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), IvfError> {
        if self.dimension == 0 {
            return Err(IvfError::config_error(
                "dimension",
                "must be greater than 0",
                "Set dimension to the length of the vectors stored in the shards",
            ));
        }

        if self.dimension > 10_000 {
            return Err(IvfError::config_error(
                "dimension",
                format!("{} exceeds the supported maximum of 10000", self.dimension),
                "Reduce dimensionality before indexing",
            ));
        }

        self.on_disk.validate()
    }

    /// Build the configuration after validation
    pub fn build(self) -> Result<Self, IvfError> {
        self.validate()?;
        Ok(self)
    }
}
