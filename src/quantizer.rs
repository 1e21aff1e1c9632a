//! Coarse quantizers
//!
//! A coarse quantizer maps a vector to one of `nlist` clusters. Shards only merge
//! when they share the same quantizer, which is checked through
//! [`CoarseQuantizer::fingerprint`]. Training is outside the scope of this crate:
//! [`FlatQuantizer`] is "trained" by installing caller-supplied centroids.

use crate::distance::DistanceMetric;
use crate::error::IvfError;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Assignment of vectors to inverted lists
pub trait CoarseQuantizer: Send + Sync + std::fmt::Debug {
    /// Number of clusters
    fn nlist(&self) -> usize;

    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    fn is_trained(&self) -> bool;

    /// Closest list for `vector`
    fn assign(&self, vector: &[f32]) -> Result<usize, IvfError>;

    /// The `nprobe` closest lists for `query`, closest first
    fn probe(&self, query: &[f32], nprobe: usize) -> Result<Vec<usize>, IvfError>;

    /// Stable digest of the quantizer's parameters and centroids
    ///
    /// Two quantizers with equal fingerprints assign every vector identically.
    fn fingerprint(&self) -> u64;
}

/// Exhaustive nearest-centroid quantizer
#[derive(Debug, Clone)]
pub struct FlatQuantizer {
    dimension: usize,
    nlist: usize,
    metric: DistanceMetric,
    /// Row-major `nlist x dimension`; empty until trained
    centroids: Vec<f32>,
    fingerprint: u64,
}

impl FlatQuantizer {
    /// Create a quantizer with no centroids installed
    pub fn untrained(dimension: usize, nlist: usize, metric: DistanceMetric) -> Self {
        let mut quantizer = Self {
            dimension,
            nlist,
            metric,
            centroids: Vec::new(),
            fingerprint: 0,
        };
        quantizer.fingerprint = quantizer.compute_fingerprint();
        quantizer
    }

    /// Create a trained quantizer from row-major centroids
    pub fn from_centroids(dimension: usize, metric: DistanceMetric, centroids: Vec<f32>) -> Result<Self, IvfError> {
        if dimension == 0 || centroids.is_empty() || centroids.len() % dimension != 0 {
            return Err(IvfError::invalid_input(
                "centroids",
                format!("{} values cannot form centroids of dimension {}", centroids.len(), dimension),
                "Pass nlist * dimension values in row-major order",
            ));
        }
        let mut quantizer = Self::untrained(dimension, centroids.len() / dimension, metric);
        quantizer.train(centroids)?;
        Ok(quantizer)
    }

    /// Install centroids, marking the quantizer trained
    pub fn train(&mut self, centroids: Vec<f32>) -> Result<(), IvfError> {
        if centroids.len() != self.nlist * self.dimension {
            return Err(IvfError::invalid_input(
                "centroids",
                format!(
                    "expected {} values ({} lists of dimension {}), got {}",
                    self.nlist * self.dimension,
                    self.nlist,
                    self.dimension,
                    centroids.len()
                ),
                "Pass exactly nlist * dimension values",
            ));
        }
        self.centroids = centroids;
        self.fingerprint = self.compute_fingerprint();
        Ok(())
    }

    pub fn centroid(&self, list_no: usize) -> Option<&[f32]> {
        self.centroids.get(list_no * self.dimension..(list_no + 1) * self.dimension)
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.dimension.hash(&mut hasher);
        self.nlist.hash(&mut hasher);
        self.metric.name().hash(&mut hasher);
        for value in &self.centroids {
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn check_query(&self, vector: &[f32], operation: &str) -> Result<(), IvfError> {
        if !self.is_trained() {
            return Err(IvfError::not_trained(operation));
        }
        if vector.len() != self.dimension {
            return Err(IvfError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn scores<'a>(&'a self, vector: &'a [f32]) -> impl Iterator<Item = (usize, f32)> + 'a {
        let metric = self.metric;
        self.centroids
            .chunks_exact(self.dimension)
            .enumerate()
            .map(move |(list_no, centroid)| (list_no, metric.distance_unchecked(vector, centroid)))
    }
}

impl CoarseQuantizer for FlatQuantizer {
    fn nlist(&self) -> usize {
        self.nlist
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn assign(&self, vector: &[f32]) -> Result<usize, IvfError> {
        self.check_query(vector, "assign")?;
        let metric = self.metric;
        let best = self
            .scores(vector)
            .reduce(|best, candidate| if metric.is_better(candidate.1, best.1) { candidate } else { best });
        best.map(|(list_no, _)| list_no)
            .ok_or_else(|| IvfError::not_trained("assign"))
    }

    fn probe(&self, query: &[f32], nprobe: usize) -> Result<Vec<usize>, IvfError> {
        self.check_query(query, "probe")?;
        let metric = self.metric;
        let mut scored: Vec<(usize, f32)> = self.scores(query).collect();
        scored.sort_by(|a, b| metric.compare(a.1, b.1).then(a.0.cmp(&b.0)));
        scored.truncate(nprobe.min(self.nlist));
        Ok(scored.into_iter().map(|(list_no, _)| list_no).collect())
    }

    fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_quantizer() -> FlatQuantizer {
        FlatQuantizer::from_centroids(2, DistanceMetric::L2, vec![0.0, 0.0, 10.0, 0.0, 0.0, 10.0]).unwrap()
    }

    #[test]
    fn test_untrained_quantizer() {
        let quantizer = FlatQuantizer::untrained(4, 8, DistanceMetric::L2);
        assert!(!quantizer.is_trained());
        assert_eq!(quantizer.nlist(), 8);
        assert!(matches!(quantizer.assign(&[0.0; 4]), Err(IvfError::NotTrained { .. })));
        assert!(matches!(quantizer.probe(&[0.0; 4], 2), Err(IvfError::NotTrained { .. })));
    }

    #[test]
    fn test_assign_nearest_centroid() {
        let quantizer = grid_quantizer();
        assert!(quantizer.is_trained());
        assert_eq!(quantizer.nlist(), 3);
        assert_eq!(quantizer.assign(&[1.0, 1.0]).unwrap(), 0);
        assert_eq!(quantizer.assign(&[9.0, 1.0]).unwrap(), 1);
        assert_eq!(quantizer.assign(&[1.0, 8.0]).unwrap(), 2);
    }

    #[test]
    fn test_probe_orders_by_distance() {
        let quantizer = grid_quantizer();
        assert_eq!(quantizer.probe(&[8.0, 1.0], 3).unwrap(), vec![1, 0, 2]);
        assert_eq!(quantizer.probe(&[8.0, 1.0], 1).unwrap(), vec![1]);
        assert_eq!(quantizer.probe(&[8.0, 1.0], 10).unwrap().len(), 3);
    }

    #[test]
    fn test_dimension_checked() {
        let quantizer = grid_quantizer();
        assert!(matches!(
            quantizer.assign(&[1.0]),
            Err(IvfError::InvalidDimension { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_fingerprint_tracks_centroids() {
        let a = grid_quantizer();
        let b = grid_quantizer();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = FlatQuantizer::from_centroids(2, DistanceMetric::L2, vec![0.0, 0.0, 10.0, 0.0, 0.0, 11.0]).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());

        let d = FlatQuantizer::from_centroids(2, DistanceMetric::InnerProduct, vec![0.0, 0.0, 10.0, 0.0, 0.0, 10.0])
            .unwrap();
        assert_ne!(a.fingerprint(), d.fingerprint());

        let mut e = FlatQuantizer::untrained(2, 3, DistanceMetric::L2);
        let untrained = e.fingerprint();
        e.train(vec![0.0, 0.0, 10.0, 0.0, 0.0, 10.0]).unwrap();
        assert_ne!(untrained, e.fingerprint());
        assert_eq!(e.fingerprint(), a.fingerprint());
    }

    #[test]
    fn test_invalid_centroids() {
        assert!(FlatQuantizer::from_centroids(3, DistanceMetric::L2, vec![0.0; 4]).is_err());
        assert!(FlatQuantizer::from_centroids(0, DistanceMetric::L2, vec![0.0; 4]).is_err());
        let mut quantizer = FlatQuantizer::untrained(2, 2, DistanceMetric::L2);
        assert!(quantizer.train(vec![0.0; 3]).is_err());
        assert!(!quantizer.is_trained());
    }
}
