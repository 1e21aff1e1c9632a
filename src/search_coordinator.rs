//! Result ranking and cross-shard result merging
//!
//! [`TopK`] collects the best `k` candidates of one query inside a shard.
//! [`merge_shard_results`] combines per-shard result matrices into one with a
//! k-way merge per query. Both rank through the metric so the same code serves
//! L2 distances (smaller first) and inner products (larger first).

use crate::distance::DistanceMetric;
use crate::error::IvfError;
use crate::structures::{Idx, SearchResults, MISSING_LABEL};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Map a score onto a key where smaller always ranks first
#[inline]
fn rank_key(metric: DistanceMetric, distance: f32) -> f32 {
    match metric {
        DistanceMetric::L2 => distance,
        DistanceMetric::InnerProduct => -distance,
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: f32,
    distance: f32,
    label: Idx,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key).then(self.label.cmp(&other.label))
    }
}

/// Bounded collector of the `k` best candidates
///
/// A max-heap keyed on rank keeps the current worst candidate on top so each
/// push costs `O(log k)`. Equal scores rank the lower label first.
#[derive(Debug)]
pub struct TopK {
    metric: DistanceMetric,
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    pub fn new(metric: DistanceMetric, k: usize) -> Self {
        Self {
            metric,
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, distance: f32, label: Idx) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate {
            key: rank_key(self.metric, distance),
            distance,
            label,
        };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Write the candidates best first into a result row, padding with empty slots
    pub fn write_row(self, distances: &mut [f32], labels: &mut [Idx]) {
        let worst = self.metric.worst();
        let sorted = self.heap.into_sorted_vec();
        for slot in 0..distances.len() {
            match sorted.get(slot) {
                Some(candidate) => {
                    distances[slot] = candidate.distance;
                    labels[slot] = candidate.label;
                }
                None => {
                    distances[slot] = worst;
                    labels[slot] = MISSING_LABEL;
                }
            }
        }
    }
}

/// Head of one shard's row during a k-way merge
#[derive(Debug, Clone, Copy)]
struct Head {
    key: f32,
    shard: usize,
    pos: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then(self.shard.cmp(&other.shard))
            .then(self.pos.cmp(&other.pos))
    }
}

/// Merge per-shard results into the global top-`k` of every query
///
/// Every part must cover the same queries and hold rows sorted best first.
/// Equal scores from different shards keep the lower shard index first, and
/// empty slots (label [`MISSING_LABEL`]) are skipped so they never displace real
/// results. Shards never store that label, so no real entry is dropped.
pub fn merge_shard_results(
    metric: DistanceMetric,
    parts: &[SearchResults],
    nq: usize,
    k: usize,
) -> Result<SearchResults, IvfError> {
    if let Some(bad) = parts.iter().find(|part| part.nq != nq) {
        return Err(IvfError::invalid_input(
            "shard results",
            format!("shard answered {} queries, expected {}", bad.nq, nq),
            "Search every shard with the same query batch",
        ));
    }

    let mut merged = SearchResults::empty(nq, k, metric.worst());
    let mut heap = BinaryHeap::with_capacity(parts.len());

    for q in 0..nq {
        heap.clear();
        for (shard, part) in parts.iter().enumerate() {
            let (distances, labels) = part.row(q);
            if let Some(&label) = labels.first() {
                if label != MISSING_LABEL {
                    heap.push(Reverse(Head {
                        key: rank_key(metric, distances[0]),
                        shard,
                        pos: 0,
                    }));
                }
            }
        }

        let (out_distances, out_labels) = merged.row_mut(q);
        let mut filled = 0;
        while filled < k {
            let Some(Reverse(head)) = heap.pop() else {
                break;
            };
            let (distances, labels) = parts[head.shard].row(q);
            out_distances[filled] = distances[head.pos];
            out_labels[filled] = labels[head.pos];
            filled += 1;

            let next = head.pos + 1;
            if next < labels.len() && labels[next] != MISSING_LABEL {
                heap.push(Reverse(Head {
                    key: rank_key(metric, distances[next]),
                    shard: head.shard,
                    pos: next,
                }));
            }
        }
    }

    Ok(merged)
}
