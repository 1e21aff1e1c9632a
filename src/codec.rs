//! Vector codecs
//!
//! A codec turns a vector into a fixed-size byte code stored in a posting list
//! and scores a query against a stored code. Merging never re-encodes: codes are
//! moved between stores byte for byte, so any codec works with every merge path.

use crate::distance::DistanceMetric;
use crate::error::IvfError;

/// Fixed-size vector encoding
pub trait VectorCodec: Send + Sync + std::fmt::Debug {
    fn dimension(&self) -> usize;

    /// Bytes per code
    fn code_size(&self) -> usize;

    /// Append the code of `vector` to `out`
    fn encode(&self, vector: &[f32], out: &mut Vec<u8>) -> Result<(), IvfError>;

    fn decode(&self, code: &[u8]) -> Result<Vec<f32>, IvfError>;

    /// Score `query` against a stored code under `metric`
    fn distance(&self, metric: DistanceMetric, query: &[f32], code: &[u8]) -> Result<f32, IvfError>;
}

/// Lossless codec storing each component as a little-endian `f32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatCodec {
    dimension: usize,
}

impl FlatCodec {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), IvfError> {
        if vector.len() != self.dimension {
            return Err(IvfError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn check_code(&self, code: &[u8]) -> Result<(), IvfError> {
        if code.len() != self.code_size() {
            return Err(IvfError::invalid_input(
                "code",
                format!("expected {} bytes, got {}", self.code_size(), code.len()),
                "Pass codes produced by a codec of the same dimension",
            ));
        }
        Ok(())
    }

    fn components(code: &[u8]) -> impl Iterator<Item = f32> + '_ {
        code.chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl VectorCodec for FlatCodec {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn code_size(&self) -> usize {
        self.dimension * std::mem::size_of::<f32>()
    }

    fn encode(&self, vector: &[f32], out: &mut Vec<u8>) -> Result<(), IvfError> {
        self.check_vector(vector)?;
        out.reserve(self.code_size());
        for value in vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn decode(&self, code: &[u8]) -> Result<Vec<f32>, IvfError> {
        self.check_code(code)?;
        Ok(Self::components(code).collect())
    }

    fn distance(&self, metric: DistanceMetric, query: &[f32], code: &[u8]) -> Result<f32, IvfError> {
        self.check_vector(query)?;
        self.check_code(code)?;
        let pairs = query.iter().zip(Self::components(code));
        Ok(match metric {
            DistanceMetric::L2 => pairs
                .map(|(q, x)| {
                    let d = q - x;
                    d * d
                })
                .sum(),
            DistanceMetric::InnerProduct => pairs.map(|(q, x)| q * x).sum(),
        })
    }
}
