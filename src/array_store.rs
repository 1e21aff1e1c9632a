//! In-memory posting store
//!
//! Each list is a pair of growable vectors: identifiers and concatenated codes.

use crate::error::IvfError;
use crate::posting_store::{check_batch, check_code, check_list, check_truncate, PostingStore, StoreKind};
use crate::structures::{Idx, PostingList};

/// Posting store backed by heap vectors
#[derive(Debug, Clone)]
pub struct ArrayPostingStore {
    nlist: usize,
    code_size: usize,
    ids: Vec<Vec<Idx>>,
    codes: Vec<Vec<u8>>,
}

impl ArrayPostingStore {
    /// Create a store with `nlist` empty lists of `code_size` byte codes
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self {
            nlist,
            code_size,
            ids: vec![Vec::new(); nlist],
            codes: vec![Vec::new(); nlist],
        }
    }

    /// Identifiers of `list_no` as a slice
    pub fn list_ids(&self, list_no: usize) -> Result<&[Idx], IvfError> {
        check_list(list_no, self.nlist)?;
        Ok(&self.ids[list_no])
    }

    /// Concatenated codes of `list_no` as a slice
    pub fn list_codes(&self, list_no: usize) -> Result<&[u8], IvfError> {
        check_list(list_no, self.nlist)?;
        Ok(&self.codes[list_no])
    }

    fn check_entry(&self, list_no: usize, offset: usize) -> Result<(), IvfError> {
        check_list(list_no, self.nlist)?;
        let len = self.ids[list_no].len();
        if offset >= len {
            return Err(IvfError::EntryOutOfRange { list_no, offset, len });
        }
        Ok(())
    }
}

impl PostingStore for ArrayPostingStore {
    fn nlist(&self) -> usize {
        self.nlist
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn list_len(&self, list_no: usize) -> Result<usize, IvfError> {
        check_list(list_no, self.nlist)?;
        Ok(self.ids[list_no].len())
    }

    fn entry_id(&self, list_no: usize, offset: usize) -> Result<Idx, IvfError> {
        self.check_entry(list_no, offset)?;
        Ok(self.ids[list_no][offset])
    }

    fn entry_code(&self, list_no: usize, offset: usize) -> Result<&[u8], IvfError> {
        self.check_entry(list_no, offset)?;
        let start = offset * self.code_size;
        Ok(&self.codes[list_no][start..start + self.code_size])
    }

    fn append_entry(&mut self, list_no: usize, id: Idx, code: &[u8]) -> Result<usize, IvfError> {
        check_list(list_no, self.nlist)?;
        check_code(code, self.code_size)?;
        self.ids[list_no].push(id);
        self.codes[list_no].extend_from_slice(code);
        Ok(self.ids[list_no].len() - 1)
    }

    fn append_entries(&mut self, list_no: usize, ids: &[Idx], codes: &[u8]) -> Result<usize, IvfError> {
        check_list(list_no, self.nlist)?;
        check_batch(self.code_size, ids, codes)?;
        let first = self.ids[list_no].len();
        self.ids[list_no].extend_from_slice(ids);
        self.codes[list_no].extend_from_slice(codes);
        Ok(first)
    }

    fn truncate_list(&mut self, list_no: usize, len: usize) -> Result<(), IvfError> {
        check_list(list_no, self.nlist)?;
        check_truncate(list_no, len, self.ids[list_no].len())?;
        self.ids[list_no].truncate(len);
        self.codes[list_no].truncate(len * self.code_size);
        Ok(())
    }

    fn read_list(&self, list_no: usize) -> Result<PostingList, IvfError> {
        check_list(list_no, self.nlist)?;
        Ok(PostingList {
            ids: self.ids[list_no].clone(),
            codes: self.codes[list_no].clone(),
        })
    }

    fn total_entries(&self) -> usize {
        self.ids.iter().map(Vec::len).sum()
    }

    fn kind(&self) -> StoreKind {
        StoreKind::InMemory
    }

    fn release(self: Box<Self>) -> Result<(), IvfError> {
        tracing::debug!(
            nlist = self.nlist,
            entries = self.total_entries(),
            "releasing in-memory posting store"
        );
        Ok(())
    }
}
