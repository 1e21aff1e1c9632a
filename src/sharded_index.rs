//! Sharded index with merge orchestration
//!
//! [`ShardedIndex`] owns an ordered collection of shards, each behind its own
//! `RwLock`. Adds are split into contiguous blocks, one per shard, and run on the
//! rayon pool; searches fan out to every shard under read locks and the per-shard
//! answers are combined by a k-way merge. Two merge paths collapse the shards:
//!
//! - [`ShardedIndex::merge_into_first`] moves every shard's entries into shard 0
//!   with the pairwise [`ShardMerger`]
//! - [`ShardedIndex::consolidate_on_disk`] streams every shard's lists into one
//!   file with [`OnDiskConsolidator`] and installs it as shard 0's store
//!
//! Both hold write locks on every shard, acquired in index order, for the whole
//! operation, validate every shard before the first entry moves, and recompute
//! the index totals from the shards afterwards. A merge that fails part way is
//! rolled back and leaves every shard as it was.
//!
//! Shards are registered either as IVF shards, which expose a posting store and
//! can be merged, or as opaque [`SearchShard`] implementations that only take
//! part in add and search. The capability is fixed at registration.

use crate::config::ShardedIndexConfig;
use crate::consolidator::OnDiskConsolidator;
use crate::distance::DistanceMetric;
use crate::error::IvfError;
use crate::merger::ShardMerger;
use crate::posting_store::PostingStore;
use crate::search_coordinator::merge_shard_results;
use crate::shard::{vector_count, IvfShard, SearchShard};
use crate::structures::{Idx, SearchResults, MISSING_LABEL};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registered shard, tagged with its capabilities
#[derive(Debug, Clone)]
pub enum ShardHandle {
    /// Posting-store backed shard; supports merging and store replacement
    Ivf(Arc<RwLock<IvfShard>>),
    /// Any other shard; add and search only
    Opaque(Arc<RwLock<Box<dyn SearchShard>>>),
}

impl ShardHandle {
    pub fn is_mergeable(&self) -> bool {
        matches!(self, ShardHandle::Ivf(_))
    }

    fn ntotal(&self) -> usize {
        match self {
            ShardHandle::Ivf(shard) => shard.read().ntotal(),
            ShardHandle::Opaque(shard) => shard.read().ntotal(),
        }
    }

    fn is_trained(&self) -> bool {
        match self {
            ShardHandle::Ivf(shard) => shard.read().is_trained(),
            ShardHandle::Opaque(shard) => shard.read().is_trained(),
        }
    }

    fn add_with_ids(&self, vectors: &[f32], ids: Option<&[Idx]>) -> Result<(), IvfError> {
        match self {
            ShardHandle::Ivf(shard) => shard.write().add_with_ids(vectors, ids),
            ShardHandle::Opaque(shard) => shard.write().add_with_ids(vectors, ids),
        }
    }

    fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults, IvfError> {
        match self {
            ShardHandle::Ivf(shard) => shard.read().search(queries, k),
            ShardHandle::Opaque(shard) => shard.read().search(queries, k),
        }
    }

    fn same_shard(&self, other: &ShardHandle) -> bool {
        match (self, other) {
            (ShardHandle::Ivf(a), ShardHandle::Ivf(b)) => Arc::ptr_eq(a, b),
            (ShardHandle::Opaque(a), ShardHandle::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Lifecycle of the index as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No shards, or at least one shard without a trained quantizer
    Untrained,
    /// Every shard trained, no vectors yet
    Trained,
    /// Every shard trained and at least one vector added
    Populated,
}

/// Collection of shards searched and merged as one index
#[derive(Debug)]
pub struct ShardedIndex {
    config: ShardedIndexConfig,
    shards: Vec<ShardHandle>,
    ntotal: usize,
    is_trained: bool,
}

impl ShardedIndex {
    /// Create an empty index after validating `config`
    pub fn new(config: ShardedIndexConfig) -> Result<Self, IvfError> {
        config.validate()?;
        Ok(Self {
            config,
            shards: Vec::new(),
            ntotal: 0,
            is_trained: false,
        })
    }

    pub fn config(&self) -> &ShardedIndexConfig {
        &self.config
    }

    pub fn nshards(&self) -> usize {
        self.shards.len()
    }

    /// Number of vectors across all shards as of the last resynchronization
    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    pub fn state(&self) -> IndexState {
        match (self.is_trained, self.ntotal) {
            (false, _) => IndexState::Untrained,
            (true, 0) => IndexState::Trained,
            (true, _) => IndexState::Populated,
        }
    }

    /// Entry count of every shard, in shard order
    pub fn shard_totals(&self) -> Vec<usize> {
        self.shards.iter().map(ShardHandle::ntotal).collect()
    }

    /// Register an owned IVF shard, returning its index
    pub fn add_shard(&mut self, shard: IvfShard) -> Result<usize, IvfError> {
        self.add_shared_shard(Arc::new(RwLock::new(shard)))
    }

    /// Register an IVF shard the caller keeps a handle to
    pub fn add_shared_shard(&mut self, shard: Arc<RwLock<IvfShard>>) -> Result<usize, IvfError> {
        {
            let guard = shard.read();
            self.check_registration(guard.dimension(), guard.metric())?;
        }
        self.register(ShardHandle::Ivf(shard))
    }

    /// Register a shard that only supports add and search
    pub fn add_opaque_shard(&mut self, shard: Box<dyn SearchShard>) -> Result<usize, IvfError> {
        self.check_registration(shard.dimension(), shard.metric())?;
        self.register(ShardHandle::Opaque(Arc::new(RwLock::new(shard))))
    }

    fn check_registration(&self, dimension: usize, metric: DistanceMetric) -> Result<(), IvfError> {
        if dimension != self.config.dimension {
            return Err(IvfError::configuration_mismatch("dimension", self.config.dimension, dimension));
        }
        if metric != self.config.metric {
            return Err(IvfError::configuration_mismatch(
                "metric",
                self.config.metric.name(),
                metric.name(),
            ));
        }
        Ok(())
    }

    fn register(&mut self, handle: ShardHandle) -> Result<usize, IvfError> {
        if self.shards.iter().any(|existing| existing.same_shard(&handle)) {
            return Err(IvfError::invalid_input(
                "shard",
                "shard is already registered with this index",
                "Register each shard once",
            ));
        }
        self.shards.push(handle);
        self.sync_after_merge();
        debug!(nshards = self.shards.len(), ntotal = self.ntotal, "registered shard");
        Ok(self.shards.len() - 1)
    }

    /// Handle of shard `shard_index`
    pub fn shard(&self, shard_index: usize) -> Result<&ShardHandle, IvfError> {
        self.shards.get(shard_index).ok_or_else(|| {
            IvfError::invalid_input(
                "shard_index",
                format!("{} is out of range for {} shards", shard_index, self.shards.len()),
                "Use an index returned when the shard was registered",
            )
        })
    }

    fn ivf_shard(&self, shard_index: usize, operation: &str) -> Result<&Arc<RwLock<IvfShard>>, IvfError> {
        match self.shard(shard_index)? {
            ShardHandle::Ivf(shard) => Ok(shard),
            ShardHandle::Opaque(_) => Err(IvfError::unsupported(
                operation,
                format!("shard {} does not expose a posting store", shard_index),
            )),
        }
    }

    /// Add vectors, numbering them globally or per shard as configured
    pub fn add(&mut self, vectors: &[f32]) -> Result<(), IvfError> {
        if self.config.successive_ids {
            let n = vector_count(vectors, self.config.dimension, "vectors")?;
            let ids: Vec<Idx> = (self.ntotal..self.ntotal + n).map(|id| id as Idx).collect();
            self.add_partitioned(vectors, Some(&ids))
        } else {
            self.add_partitioned(vectors, None)
        }
    }

    /// Add vectors with explicit identifiers
    ///
    /// Identifier -1 is reserved for empty result slots and rejected.
    pub fn add_with_ids(&mut self, vectors: &[f32], ids: &[Idx]) -> Result<(), IvfError> {
        self.add_partitioned(vectors, Some(ids))
    }

    /// Split the batch into one contiguous block per shard, the last shard taking the remainder
    fn add_partitioned(&mut self, vectors: &[f32], ids: Option<&[Idx]>) -> Result<(), IvfError> {
        if !self.is_trained {
            return Err(IvfError::not_trained("add"));
        }
        let dimension = self.config.dimension;
        let n = vector_count(vectors, dimension, "vectors")?;
        if let Some(ids) = ids {
            if ids.len() != n {
                return Err(IvfError::invalid_input(
                    "ids",
                    format!("{} identifiers for {} vectors", ids.len(), n),
                    "Pass one identifier per vector",
                ));
            }
            if ids.contains(&MISSING_LABEL) {
                return Err(IvfError::invalid_input(
                    "ids",
                    format!("identifier {} marks empty result slots", MISSING_LABEL),
                    "Use identifiers other than -1",
                ));
            }
        }
        if n == 0 {
            return Ok(());
        }

        let nshards = self.shards.len();
        let block = n / nshards;
        let jobs: Vec<(&ShardHandle, &[f32], Option<&[Idx]>)> = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(i, shard)| {
                let start = i * block;
                let end = if i + 1 == nshards { n } else { start + block };
                (end > start).then(|| {
                    (
                        shard,
                        &vectors[start * dimension..end * dimension],
                        ids.map(|ids| &ids[start..end]),
                    )
                })
            })
            .collect();

        let results: Vec<Result<(), IvfError>> = if self.config.parallel {
            jobs.par_iter()
                .map(|(shard, block, ids)| shard.add_with_ids(block, *ids))
                .collect()
        } else {
            jobs.iter()
                .map(|(shard, block, ids)| shard.add_with_ids(block, *ids))
                .collect()
        };

        self.sync_after_merge();
        results.into_iter().collect::<Result<(), IvfError>>()?;

        debug!(added = n, nshards, ntotal = self.ntotal, "added vectors");
        Ok(())
    }

    /// Search every shard and merge the answers per query
    pub fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults, IvfError> {
        if !self.is_trained {
            return Err(IvfError::not_trained("search"));
        }
        let nq = vector_count(queries, self.config.dimension, "queries")?;

        let parts: Vec<SearchResults> = if self.config.parallel {
            self.shards
                .par_iter()
                .map(|shard| shard.search(queries, k))
                .collect::<Result<_, _>>()?
        } else {
            self.shards
                .iter()
                .map(|shard| shard.search(queries, k))
                .collect::<Result<_, _>>()?
        };

        merge_shard_results(self.config.metric, &parts, nq, k)
    }

    /// Read-locked view of shard `shard_index`'s posting store
    pub fn get_store(&self, shard_index: usize) -> Result<MappedRwLockReadGuard<'_, dyn PostingStore>, IvfError> {
        let shard = self.ivf_shard(shard_index, "get_store")?;
        Ok(RwLockReadGuard::map(shard.read(), |shard| shard.store()))
    }

    /// Swap the posting store of shard `shard_index`
    ///
    /// With `take_ownership` the previous store is released once swapped out and
    /// `None` is returned; otherwise the previous store is handed back to the caller.
    pub fn replace_shard_store(
        &mut self,
        shard_index: usize,
        store: Box<dyn PostingStore>,
        take_ownership: bool,
    ) -> Result<Option<Box<dyn PostingStore>>, IvfError> {
        let shard = Arc::clone(self.ivf_shard(shard_index, "replace_shard_store")?);
        let old = shard.write().replace_store(store)?;
        self.sync_after_merge();

        debug!(shard_index, take_ownership, ntotal = self.ntotal, "replaced shard store");
        if take_ownership {
            old.release()?;
            Ok(None)
        } else {
            Ok(Some(old))
        }
    }

    /// Recompute `ntotal` and `is_trained` from the shards
    pub fn sync_after_merge(&mut self) {
        self.ntotal = self.shards.iter().map(ShardHandle::ntotal).sum();
        self.is_trained = !self.shards.is_empty() && self.shards.iter().all(ShardHandle::is_trained);
    }

    /// Write-lock every shard in index order, failing if any cannot be merged
    fn lock_for_merge(&self, operation: &str) -> Result<Vec<RwLockWriteGuard<'_, IvfShard>>, IvfError> {
        if self.shards.is_empty() {
            return Err(IvfError::invalid_input(
                "shards",
                "the index has no shards",
                "Register shards before merging",
            ));
        }
        let handles = self
            .shards
            .iter()
            .enumerate()
            .map(|(i, handle)| match handle {
                ShardHandle::Ivf(shard) => Ok(shard),
                ShardHandle::Opaque(_) => Err(IvfError::unsupported(
                    operation,
                    format!("shard {} was registered without a posting store", i),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let guards: Vec<_> = handles.into_iter().map(|shard| shard.write()).collect();
        if let Some(untrained) = guards.iter().position(|shard| !shard.is_trained()) {
            return Err(IvfError::not_trained(format!("{} (shard {})", operation, untrained)));
        }
        for src in &guards[1..] {
            ShardMerger::check_compatible(&guards[0], src)?;
        }
        Ok(guards)
    }

    /// Detach every source store after a merge, releasing it when the index owns its shards
    ///
    /// Every source is emptied before any release runs, so a failed release never
    /// leaves entries counted in both shard 0 and a source.
    fn detach_sources(&self, sources: &mut [RwLockWriteGuard<'_, IvfShard>]) -> Result<(), IvfError> {
        let stores: Vec<_> = sources.iter_mut().map(|source| source.take_store()).collect();
        if !self.config.own_shards {
            return Ok(());
        }
        let mut first_error = None;
        for (i, store) in stores.into_iter().enumerate() {
            if let Err(e) = store.release() {
                warn!(shard = i + 1, error = %e, "failed to release merged source store");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Merge every shard into shard 0 with the pairwise merger
    ///
    /// Returns the number of entries moved. Afterwards shard 0 holds every entry
    /// and the other shards are empty. On error every shard is left as it was.
    pub fn merge_into_first(&mut self, shift_ids: bool) -> Result<usize, IvfError> {
        let result = self.merge_locked(shift_ids);
        self.sync_after_merge();
        let moved = result?;

        info!(moved, shift_ids, ntotal = self.ntotal, "merged shards into shard 0");
        Ok(moved)
    }

    fn merge_locked(&self, shift_ids: bool) -> Result<usize, IvfError> {
        let mut guards = self.lock_for_merge("merge_into_first")?;
        let (first, rest) = guards.split_at_mut(1);
        let checkpoint = first[0].checkpoint()?;
        let mut moved = 0;
        for (i, src) in rest.iter().enumerate() {
            match ShardMerger::merge(&mut first[0], src, shift_ids) {
                Ok(n) => moved += n,
                Err(e) => {
                    // Undo the sources merged so far; none of them has been detached yet
                    first[0].rollback(&checkpoint);
                    warn!(shard = i + 1, error = %e, "merge failed, shard 0 rolled back");
                    return Err(e);
                }
            }
        }
        self.detach_sources(rest)?;
        Ok(moved)
    }

    /// Consolidate every shard into one on-disk store installed as shard 0's
    ///
    /// The file at `output_path` is a persistent artifact: the installed store does
    /// not delete it on release. Returns the number of entries written.
    pub fn consolidate_on_disk(&mut self, shift_ids: bool, output_path: &Path) -> Result<usize, IvfError> {
        let result = self.consolidate_locked(shift_ids, output_path);
        self.sync_after_merge();
        let total = result?;

        info!(
            path = %output_path.display(),
            entries = total,
            shift_ids,
            "consolidated shards on disk"
        );
        Ok(total)
    }

    fn consolidate_locked(&self, shift_ids: bool, output_path: &Path) -> Result<usize, IvfError> {
        let mut guards = self.lock_for_merge("consolidate_on_disk")?;

        let (mut store, total) = {
            let sources: Vec<&dyn PostingStore> = guards.iter().map(|shard| shard.store()).collect();
            OnDiskConsolidator::consolidate_with_config(&sources, shift_ids, output_path, self.config.on_disk.clone())?
        };
        store.set_owns_file(false);

        let (first, rest) = guards.split_at_mut(1);
        let old = first[0].replace_store(Box::new(store))?;
        if self.config.own_shards {
            old.release()?;
        }
        self.detach_sources(rest)?;
        Ok(total)
    }
}

impl Drop for ShardedIndex {
    fn drop(&mut self) {
        if !self.config.own_shards {
            return;
        }
        for (i, handle) in self.shards.drain(..).enumerate() {
            let ShardHandle::Ivf(shard) = handle else {
                continue;
            };
            // Shards still shared with the caller are left to them
            if let Ok(lock) = Arc::try_unwrap(shard) {
                if let Err(e) = lock.into_inner().release() {
                    warn!(shard = i, error = %e, "failed to release shard store");
                }
            }
        }
    }
}
