//! In-place merging of one shard into another
//!
//! [`ShardMerger::merge`] appends every entry of a source shard to the matching
//! list of a destination shard. Lists are processed in order and entries keep
//! their relative order, so a destination list ends up as its old contents
//! followed by the source list. With identifier shifting enabled every source
//! identifier is offset by the destination's `ntotal` read once when the merge
//! starts; repeated merges into the same destination therefore stack their ranges
//! without collisions.
//!
//! All compatibility checks, including the range of every shifted identifier,
//! run before the first entry moves. A merge that fails while appending is rolled
//! back, so a failed merge leaves both shards as they were.

use crate::error::IvfError;
use crate::posting_store::{check_id_shift, check_store_compatible, list_lengths, truncate_lists, PostingStore};
use crate::shard::{IvfShard, SearchShard};
use crate::structures::Idx;
use tracing::{debug, warn};

/// Append every list of `src` to the matching list of `dst`, adding `id_shift` to each identifier
///
/// Returns the number of entries moved. Only one source list is materialized at a
/// time. If an append fails, `dst` lists are truncated back to their old lengths.
pub fn merge_posting_lists(dst: &mut dyn PostingStore, src: &dyn PostingStore, id_shift: Idx) -> Result<usize, IvfError> {
    check_store_compatible(dst, src)?;
    check_id_shift(src, id_shift)?;

    let lengths = list_lengths(dst)?;
    append_lists(dst, src, id_shift).map_err(|e| {
        if let Err(undo) = truncate_lists(dst, &lengths) {
            warn!(error = %undo, "failed to truncate lists after an interrupted merge");
        }
        e
    })
}

fn append_lists(dst: &mut dyn PostingStore, src: &dyn PostingStore, id_shift: Idx) -> Result<usize, IvfError> {
    let mut moved = 0;
    for list_no in 0..src.nlist() {
        if src.list_len(list_no)? == 0 {
            continue;
        }
        let mut list = src.read_list(list_no)?;
        list.shift_ids(id_shift)?;
        dst.append_entries(list_no, &list.ids, &list.codes)?;
        moved += list.len();
    }
    Ok(moved)
}

/// Two-shard merge operations
pub struct ShardMerger;

impl ShardMerger {
    /// Check that `src` can be merged into `dst`
    ///
    /// Both shards must be trained and share `nlist`, `code_size` and quantizer.
    pub fn check_compatible(dst: &IvfShard, src: &IvfShard) -> Result<(), IvfError> {
        if !dst.is_trained() {
            return Err(IvfError::not_trained("merge (destination shard)"));
        }
        if !src.is_trained() {
            return Err(IvfError::not_trained("merge (source shard)"));
        }
        if dst.nlist() != src.nlist() {
            return Err(IvfError::configuration_mismatch("nlist", dst.nlist(), src.nlist()));
        }
        if dst.code_size() != src.code_size() {
            return Err(IvfError::configuration_mismatch("code_size", dst.code_size(), src.code_size()));
        }
        if dst.dimension() != src.dimension() {
            return Err(IvfError::configuration_mismatch("dimension", dst.dimension(), src.dimension()));
        }
        let (dst_fp, src_fp) = (dst.quantizer().fingerprint(), src.quantizer().fingerprint());
        if dst_fp != src_fp {
            return Err(IvfError::configuration_mismatch(
                "quantizer",
                format!("{:016x}", dst_fp),
                format!("{:016x}", src_fp),
            ));
        }
        check_store_compatible(dst.store(), src.store())
    }

    /// Merge `src` into `dst`, returning the number of entries added
    ///
    /// With `shift_ids` every source identifier `id` is stored as `id + dst.ntotal`;
    /// without it identifiers are copied verbatim and the caller guarantees they do
    /// not collide with the destination's. `src` is left unchanged.
    pub fn merge(dst: &mut IvfShard, src: &IvfShard, shift_ids: bool) -> Result<usize, IvfError> {
        Self::check_compatible(dst, src)?;

        if src.ntotal() == 0 && src.store().total_entries() == 0 {
            debug!("merge skipped, source shard is empty");
            return Ok(0);
        }

        let base = if shift_ids { dst.ntotal() as Idx } else { 0 };
        let checkpoint = dst.checkpoint()?;
        let moved = match merge_posting_lists(dst.store_mut(), src.store(), base) {
            Ok(moved) => moved,
            Err(e) => {
                dst.rollback(&checkpoint);
                return Err(e);
            }
        };
        dst.ntotal += src.ntotal();

        debug!(moved, base, dst_ntotal = dst.ntotal(), shift_ids, "merged shard");
        Ok(moved)
    }
}
