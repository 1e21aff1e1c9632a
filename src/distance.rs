//! Distance metrics for vector search
//!
//! Two metrics are supported. For [`DistanceMetric::L2`] the score is the squared
//! Euclidean distance and smaller is better; for [`DistanceMetric::InnerProduct`]
//! the score is the dot product and larger is better. Ranking code never compares
//! raw scores directly but goes through [`DistanceMetric::is_better`] so the same
//! top-k and k-way merge logic serves both.

use crate::error::IvfError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Supported distance metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared Euclidean distance, smaller is closer
    #[default]
    L2,
    /// Dot product, larger is closer
    InnerProduct,
}

impl DistanceMetric {
    /// Score `b` against `a`, validating that both have the same dimension
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32, IvfError> {
        if a.len() != b.len() {
            return Err(IvfError::InvalidDimension {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(self.distance_unchecked(a, b))
    }

    /// Score two slices assumed to have equal length
    #[inline]
    pub fn distance_unchecked(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => l2_squared(a, b),
            DistanceMetric::InnerProduct => inner_product(a, b),
        }
    }

    /// Whether score `a` ranks strictly ahead of score `b`
    #[inline]
    pub fn is_better(&self, a: f32, b: f32) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    /// Total order on scores where `Less` means "closer"
    #[inline]
    pub fn compare(&self, a: f32, b: f32) -> Ordering {
        match self {
            DistanceMetric::L2 => a.total_cmp(&b),
            DistanceMetric::InnerProduct => b.total_cmp(&a),
        }
    }

    /// Score reported for empty result slots
    pub fn worst(&self) -> f32 {
        match self {
            DistanceMetric::L2 => f32::INFINITY,
            DistanceMetric::InnerProduct => f32::NEG_INFINITY,
        }
    }

    /// Human-readable name of this metric
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }
}

/// Squared Euclidean distance
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
