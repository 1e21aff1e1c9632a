//! Core data structures shared by stores, shards and the sharded index
//!
//! - [`Idx`]: entry identifier type, signed 64-bit as stored on disk
//! - [`PostingList`]: a materialized copy of one inverted list
//! - [`SearchResults`]: row-major `nq x k` result matrix

use crate::error::IvfError;
use serde::{Deserialize, Serialize};

/// Identifier attached to every posting list entry
pub type Idx = i64;

/// Label reported in result slots that hold no entry
///
/// Reserved: shards reject it as an entry identifier, and identifier shifting
/// never produces it.
pub const MISSING_LABEL: Idx = -1;

/// `id + shift`, or `InvalidInput` if the sum overflows or lands on [`MISSING_LABEL`]
pub fn shifted_id(id: Idx, shift: Idx) -> Result<Idx, IvfError> {
    match id.checked_add(shift) {
        Some(shifted) if shifted != MISSING_LABEL || shift == 0 => Ok(shifted),
        _ => Err(IvfError::invalid_input(
            "ids",
            format!("identifier {} shifted by {} is not a valid identifier", id, shift),
            "Merge without shifting identifiers, or renumber the source entries",
        )),
    }
}

/// Owned copy of one inverted list: identifiers and codes in insertion order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostingList {
    pub ids: Vec<Idx>,
    /// Concatenated codes, `code_size` bytes per entry
    pub codes: Vec<u8>,
}

impl PostingList {
    pub fn with_capacity(entries: usize, code_size: usize) -> Self {
        Self {
            ids: Vec::with_capacity(entries),
            codes: Vec::with_capacity(entries * code_size),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn push(&mut self, id: Idx, code: &[u8]) {
        self.ids.push(id);
        self.codes.extend_from_slice(code);
    }

    /// Code of entry `i` given the store's code size
    pub fn code(&self, i: usize, code_size: usize) -> &[u8] {
        &self.codes[i * code_size..(i + 1) * code_size]
    }

    /// Add `shift` to every identifier
    ///
    /// Fails without modifying the list if any shifted identifier is invalid.
    pub fn shift_ids(&mut self, shift: Idx) -> Result<(), IvfError> {
        if shift == 0 {
            return Ok(());
        }
        let shifted = self
            .ids
            .iter()
            .map(|&id| shifted_id(id, shift))
            .collect::<Result<Vec<_>, _>>()?;
        self.ids = shifted;
        Ok(())
    }
}

/// Result matrix of a batched k-nearest-neighbor query
///
/// Row `q` holds the `k` best `(distance, label)` pairs of query `q`, best first.
/// Slots that could not be filled carry [`MISSING_LABEL`] and the metric's worst score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub nq: usize,
    pub k: usize,
    pub distances: Vec<f32>,
    pub labels: Vec<Idx>,
}

impl SearchResults {
    /// Allocate an `nq x k` matrix filled with empty slots
    pub fn empty(nq: usize, k: usize, worst: f32) -> Self {
        Self {
            nq,
            k,
            distances: vec![worst; nq * k],
            labels: vec![MISSING_LABEL; nq * k],
        }
    }

    /// Distances and labels of query `q`
    pub fn row(&self, q: usize) -> (&[f32], &[Idx]) {
        let range = q * self.k..(q + 1) * self.k;
        (&self.distances[range.clone()], &self.labels[range])
    }

    pub fn row_mut(&mut self, q: usize) -> (&mut [f32], &mut [Idx]) {
        let range = q * self.k..(q + 1) * self.k;
        (&mut self.distances[range.clone()], &mut self.labels[range])
    }

    /// Labels of query `q` without the empty slots
    pub fn found_labels(&self, q: usize) -> Vec<Idx> {
        self.row(q)
            .1
            .iter()
            .copied()
            .filter(|&label| label != MISSING_LABEL)
            .collect()
    }
}
