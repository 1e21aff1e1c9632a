//! Storage abstraction for inverted lists
//!
//! A [`PostingStore`] owns `nlist` ordered lists of `(identifier, code)` entries,
//! every code exactly `code_size` bytes. Stores are appended to list by list and
//! read back by random access; the merge and consolidation algorithms are written
//! once against this trait and work for every backing.
//!
//! Two implementations ship with the crate:
//! - [`crate::array_store::ArrayPostingStore`] keeps lists in heap vectors
//! - [`crate::ondisk_store::OnDiskPostingStore`] keeps lists in a memory-mapped file

use crate::error::IvfError;
use crate::structures::{shifted_id, Idx, PostingList};
use std::path::Path;

/// Backing kind of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    InMemory,
    OnDisk,
}

/// Per-cluster posting list storage
pub trait PostingStore: Send + Sync + std::fmt::Debug {
    /// Number of lists, fixed at creation
    fn nlist(&self) -> usize;

    /// Size in bytes of every code, fixed at creation
    fn code_size(&self) -> usize;

    /// Number of entries currently in `list_no`
    fn list_len(&self, list_no: usize) -> Result<usize, IvfError>;

    /// Identifier of entry `offset` of `list_no`
    fn entry_id(&self, list_no: usize, offset: usize) -> Result<Idx, IvfError>;

    /// Code of entry `offset` of `list_no`
    fn entry_code(&self, list_no: usize, offset: usize) -> Result<&[u8], IvfError>;

    /// Append one entry at the end of `list_no`, returning its offset
    fn append_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize, IvfError>;

    /// Append a batch of entries at the end of `list_no`, returning the offset of the first
    ///
    /// `codes` holds `ids.len() * code_size` bytes. Implementations override this
    /// when they can reserve space once for the whole batch.
    fn append_entries(&mut self, list_no: usize, ids: &[Idx], codes: &[u8]) -> Result<usize, IvfError> {
        check_batch(self.code_size(), ids, codes)?;
        let first = self.list_len(list_no)?;
        let code_size = self.code_size();
        for (i, &id) in ids.iter().enumerate() {
            self.append_entry(list_no, id, &codes[i * code_size..(i + 1) * code_size])?;
        }
        Ok(first)
    }

    /// Drop every entry of `list_no` past the first `len`
    ///
    /// Used to undo appends that were only partly applied. `len` must not exceed
    /// the current list length.
    fn truncate_list(&mut self, list_no: usize, len: usize) -> Result<(), IvfError>;

    /// Copy list `list_no` out of the store
    fn read_list(&self, list_no: usize) -> Result<PostingList, IvfError> {
        let len = self.list_len(list_no)?;
        let mut list = PostingList::with_capacity(len, self.code_size());
        for offset in 0..len {
            list.push(self.entry_id(list_no, offset)?, self.entry_code(list_no, offset)?);
        }
        Ok(list)
    }

    /// Sum of all list lengths
    fn total_entries(&self) -> usize {
        (0..self.nlist()).filter_map(|list_no| self.list_len(list_no).ok()).sum()
    }

    fn kind(&self) -> StoreKind;

    /// File backing this store, if any
    fn backing_path(&self) -> Option<&Path> {
        None
    }

    /// Persist pending changes
    fn sync(&mut self) -> Result<(), IvfError> {
        Ok(())
    }

    /// Release the store's resources
    ///
    /// In-memory stores free their buffers; file-backed stores unmap and delete
    /// their file when they own it. Called on stores detached from a shard.
    fn release(self: Box<Self>) -> Result<(), IvfError>;
}

/// Validate a list number against `nlist`
pub(crate) fn check_list(list_no: usize, nlist: usize) -> Result<(), IvfError> {
    if list_no >= nlist {
        return Err(IvfError::ListOutOfRange { list_no, nlist });
    }
    Ok(())
}

/// Validate one code against the store's code size
pub(crate) fn check_code(code: &[u8], code_size: usize) -> Result<(), IvfError> {
    if code.len() != code_size {
        return Err(IvfError::invalid_input(
            "code",
            format!("code has {} bytes but the store uses {} byte codes", code.len(), code_size),
            "Encode vectors with the codec the store was created for",
        ));
    }
    Ok(())
}

/// Validate that `codes` holds exactly one code per identifier
pub(crate) fn check_batch(code_size: usize, ids: &[Idx], codes: &[u8]) -> Result<(), IvfError> {
    if codes.len() != ids.len() * code_size {
        return Err(IvfError::invalid_input(
            "codes",
            format!(
                "{} code bytes for {} identifiers of {} byte codes",
                codes.len(),
                ids.len(),
                code_size
            ),
            "Pass one code per identifier",
        ));
    }
    Ok(())
}

/// Validate a truncation target against the current list length
pub(crate) fn check_truncate(list_no: usize, len: usize, current: usize) -> Result<(), IvfError> {
    if len > current {
        return Err(IvfError::EntryOutOfRange {
            list_no,
            offset: len,
            len: current,
        });
    }
    Ok(())
}

/// Check that two stores agree on `nlist` and `code_size`
pub fn check_store_compatible(expected: &dyn PostingStore, actual: &dyn PostingStore) -> Result<(), IvfError> {
    if expected.nlist() != actual.nlist() {
        return Err(IvfError::configuration_mismatch("nlist", expected.nlist(), actual.nlist()));
    }
    if expected.code_size() != actual.code_size() {
        return Err(IvfError::configuration_mismatch(
            "code_size",
            expected.code_size(),
            actual.code_size(),
        ));
    }
    Ok(())
}

/// Current length of every list of `store`
pub(crate) fn list_lengths(store: &dyn PostingStore) -> Result<Vec<usize>, IvfError> {
    (0..store.nlist()).map(|list_no| store.list_len(list_no)).collect()
}

/// Truncate every list of `store` that grew past `lengths`
pub(crate) fn truncate_lists(store: &mut dyn PostingStore, lengths: &[usize]) -> Result<(), IvfError> {
    for (list_no, &len) in lengths.iter().enumerate() {
        if store.list_len(list_no)? > len {
            store.truncate_list(list_no, len)?;
        }
    }
    Ok(())
}

/// Check that every identifier of `store` stays valid when offset by `shift`
///
/// Reads identifiers only, so a shifted merge can be rejected before anything is written.
pub fn check_id_shift(store: &dyn PostingStore, shift: Idx) -> Result<(), IvfError> {
    if shift == 0 {
        return Ok(());
    }
    for list_no in 0..store.nlist() {
        for offset in 0..store.list_len(list_no)? {
            shifted_id(store.entry_id(list_no, offset)?, shift)?;
        }
    }
    Ok(())
}
