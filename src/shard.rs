//! Individual index shards
//!
//! A shard is an inverted-file index over one slice of the corpus: a shared
//! coarse quantizer routes every vector to a list, a shared codec encodes it, and
//! a [`PostingStore`] keeps the `(identifier, code)` entries.
//!
//! # Key Components
//!
//! - [`SearchShard`]: the add/search surface every shard offers
//! - [`IvfShard`]: the posting-store backed shard that merges and consolidation
//!   operate on
//!
//! ```rust
//! use ivfmerge::codec::FlatCodec;
//! use ivfmerge::distance::DistanceMetric;
//! use ivfmerge::quantizer::FlatQuantizer;
//! use ivfmerge::shard::{IvfShard, SearchShard};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let quantizer = FlatQuantizer::from_centroids(2, DistanceMetric::L2, vec![0.0, 0.0, 10.0, 10.0])?;
//! let mut shard = IvfShard::new(Arc::new(quantizer), Arc::new(FlatCodec::new(2)))?;
//!
//! shard.add(&[0.5, 0.5, 9.0, 9.5])?;
//! let results = shard.search(&[9.0, 9.0], 1)?;
//! assert_eq!(results.labels, vec![1]);
//! # Ok(())
//! # }
//! ```

use crate::array_store::ArrayPostingStore;
use crate::codec::VectorCodec;
use crate::distance::DistanceMetric;
use crate::error::IvfError;
use crate::posting_store::{check_store_compatible, list_lengths, truncate_lists, PostingStore};
use crate::quantizer::CoarseQuantizer;
use crate::search_coordinator::TopK;
use crate::structures::{Idx, SearchResults, MISSING_LABEL};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::warn;

/// Add and search operations shared by every kind of shard
pub trait SearchShard: Send + Sync + std::fmt::Debug {
    fn dimension(&self) -> usize;

    /// Number of vectors held
    fn ntotal(&self) -> usize;

    fn is_trained(&self) -> bool;

    fn metric(&self) -> DistanceMetric;

    /// Add row-major `vectors`, with explicit identifiers or numbered from `ntotal`
    fn add_with_ids(&mut self, vectors: &[f32], ids: Option<&[Idx]>) -> Result<(), IvfError>;

    /// Top-`k` search for every row of `queries`
    fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults, IvfError>;
}

/// Number of row-major vectors of `dimension` in `data`
pub(crate) fn vector_count(data: &[f32], dimension: usize, field: &str) -> Result<usize, IvfError> {
    if dimension == 0 || data.len() % dimension != 0 {
        return Err(IvfError::invalid_input(
            field,
            format!("{} values are not a whole number of {}-dimensional vectors", data.len(), dimension),
            "Pass vectors as one row-major slice of length n * dimension",
        ));
    }
    Ok(data.len() / dimension)
}

/// List lengths and entry count captured before a multi-list mutation
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    lengths: Vec<usize>,
    ntotal: usize,
}

/// Inverted-file shard backed by a posting store
#[derive(Debug)]
pub struct IvfShard {
    quantizer: Arc<dyn CoarseQuantizer>,
    codec: Arc<dyn VectorCodec>,
    store: Box<dyn PostingStore>,
    pub(crate) ntotal: usize,
    nprobe: usize,
}

impl IvfShard {
    /// Create an empty shard with an in-memory store
    pub fn new(quantizer: Arc<dyn CoarseQuantizer>, codec: Arc<dyn VectorCodec>) -> Result<Self, IvfError> {
        let store = Box::new(ArrayPostingStore::new(quantizer.nlist(), codec.code_size()));
        Self::with_store(quantizer, codec, store)
    }

    /// Create a shard over an existing store; `ntotal` is taken from its contents
    pub fn with_store(
        quantizer: Arc<dyn CoarseQuantizer>,
        codec: Arc<dyn VectorCodec>,
        store: Box<dyn PostingStore>,
    ) -> Result<Self, IvfError> {
        if quantizer.dimension() != codec.dimension() {
            return Err(IvfError::configuration_mismatch(
                "dimension",
                quantizer.dimension(),
                codec.dimension(),
            ));
        }
        if store.nlist() != quantizer.nlist() {
            return Err(IvfError::configuration_mismatch("nlist", quantizer.nlist(), store.nlist()));
        }
        if store.code_size() != codec.code_size() {
            return Err(IvfError::configuration_mismatch(
                "code_size",
                codec.code_size(),
                store.code_size(),
            ));
        }

        let ntotal = store.total_entries();
        Ok(Self {
            nprobe: quantizer.nlist(),
            quantizer,
            codec,
            store,
            ntotal,
        })
    }

    pub fn nlist(&self) -> usize {
        self.quantizer.nlist()
    }

    pub fn code_size(&self) -> usize {
        self.codec.code_size()
    }

    pub fn quantizer(&self) -> &Arc<dyn CoarseQuantizer> {
        &self.quantizer
    }

    pub fn codec(&self) -> &Arc<dyn VectorCodec> {
        &self.codec
    }

    pub fn store(&self) -> &(dyn PostingStore + 'static) {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn PostingStore {
        self.store.as_mut()
    }

    /// Lists scanned per query
    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn set_nprobe(&mut self, nprobe: usize) -> Result<(), IvfError> {
        if nprobe == 0 || nprobe > self.nlist() {
            return Err(IvfError::invalid_input(
                "nprobe",
                format!("{} is outside [1, {}]", nprobe, self.nlist()),
                "Probe at least one list and at most nlist lists",
            ));
        }
        self.nprobe = nprobe;
        Ok(())
    }

    /// Install a trained quantizer with the same geometry
    pub fn train(&mut self, quantizer: Arc<dyn CoarseQuantizer>) -> Result<(), IvfError> {
        if !quantizer.is_trained() {
            return Err(IvfError::not_trained("train"));
        }
        if quantizer.nlist() != self.nlist() {
            return Err(IvfError::configuration_mismatch("nlist", self.nlist(), quantizer.nlist()));
        }
        if quantizer.dimension() != self.quantizer.dimension() {
            return Err(IvfError::configuration_mismatch(
                "dimension",
                self.quantizer.dimension(),
                quantizer.dimension(),
            ));
        }
        self.quantizer = quantizer;
        Ok(())
    }

    /// Swap in `store`, returning the previous one
    ///
    /// The new store must match this shard's `nlist` and `code_size`; the shard's
    /// `ntotal` becomes the new store's entry count.
    pub fn replace_store(&mut self, store: Box<dyn PostingStore>) -> Result<Box<dyn PostingStore>, IvfError> {
        check_store_compatible(self.store.as_ref(), store.as_ref())?;
        self.ntotal = store.total_entries();
        Ok(std::mem::replace(&mut self.store, store))
    }

    /// Detach the store, leaving the shard empty with a fresh in-memory store
    pub fn take_store(&mut self) -> Box<dyn PostingStore> {
        let empty = Box::new(ArrayPostingStore::new(self.nlist(), self.code_size()));
        self.ntotal = 0;
        std::mem::replace(&mut self.store, empty)
    }

    pub(crate) fn checkpoint(&self) -> Result<Checkpoint, IvfError> {
        Ok(Checkpoint {
            lengths: list_lengths(self.store.as_ref())?,
            ntotal: self.ntotal,
        })
    }

    /// Truncate every list back to `checkpoint` and restore `ntotal`
    ///
    /// If a list cannot be truncated, `ntotal` is recounted from the store so the
    /// shard still reports what it holds.
    pub(crate) fn rollback(&mut self, checkpoint: &Checkpoint) {
        match truncate_lists(self.store.as_mut(), &checkpoint.lengths) {
            Ok(()) => self.ntotal = checkpoint.ntotal,
            Err(e) => {
                self.ntotal = self.store.total_entries();
                warn!(error = %e, ntotal = self.ntotal, "rollback incomplete, recounted shard entries");
            }
        }
    }

    /// Add vectors with identifiers `ntotal..ntotal + n`
    pub fn add(&mut self, vectors: &[f32]) -> Result<(), IvfError> {
        self.add_with_ids(vectors, None)
    }

    /// Release the shard's store
    pub fn release(self) -> Result<(), IvfError> {
        self.store.release()
    }

    fn add_entries(&mut self, vectors: &[f32], ids: Option<&[Idx]>) -> Result<(), IvfError> {
        if !self.is_trained() {
            return Err(IvfError::not_trained("add"));
        }
        let dimension = self.dimension();
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

        // Route and encode everything before touching the store
        let mut batches: FxHashMap<usize, (Vec<Idx>, Vec<u8>)> = FxHashMap::default();
        for (i, vector) in vectors.chunks_exact(dimension).enumerate() {
            let list_no = self.quantizer.assign(vector)?;
            let id = match ids {
                Some(ids) => ids[i],
                None => (self.ntotal + i) as Idx,
            };
            let batch = batches.entry(list_no).or_default();
            batch.0.push(id);
            self.codec.encode(vector, &mut batch.1)?;
        }

        let mut lists: Vec<_> = batches.into_iter().collect();
        lists.sort_unstable_by_key(|(list_no, _)| *list_no);
        let checkpoint = self.checkpoint()?;
        for (list_no, (list_ids, codes)) in lists {
            if let Err(e) = self.store.append_entries(list_no, &list_ids, &codes) {
                self.rollback(&checkpoint);
                return Err(e);
            }
        }
        self.ntotal += n;
        Ok(())
    }

    fn search_one(&self, query: &[f32], top: &mut TopK) -> Result<(), IvfError> {
        let metric = self.metric();
        for list_no in self.quantizer.probe(query, self.nprobe)? {
            let len = self.store.list_len(list_no)?;
            for offset in 0..len {
                let code = self.store.entry_code(list_no, offset)?;
                let distance = self.codec.distance(metric, query, code)?;
                top.push(distance, self.store.entry_id(list_no, offset)?);
            }
        }
        Ok(())
    }
}

impl SearchShard for IvfShard {
    fn dimension(&self) -> usize {
        self.quantizer.dimension()
    }

    fn ntotal(&self) -> usize {
        self.ntotal
    }

    fn is_trained(&self) -> bool {
        self.quantizer.is_trained()
    }

    fn metric(&self) -> DistanceMetric {
        self.quantizer.metric()
    }

    fn add_with_ids(&mut self, vectors: &[f32], ids: Option<&[Idx]>) -> Result<(), IvfError> {
        self.add_entries(vectors, ids)
    }

    fn search(&self, queries: &[f32], k: usize) -> Result<SearchResults, IvfError> {
        if !self.is_trained() {
            return Err(IvfError::not_trained("search"));
        }
        let nq = vector_count(queries, self.dimension(), "queries")?;
        let metric = self.metric();
        let mut results = SearchResults::empty(nq, k, metric.worst());

        for (q, query) in queries.chunks_exact(self.dimension()).enumerate() {
            let mut top = TopK::new(metric, k);
            self.search_one(query, &mut top)?;
            let (distances, labels) = results.row_mut(q);
            top.write_row(distances, labels);
        }
        Ok(results)
    }
}
