//! Type-safe wrappers and core types for the vector index.
//!
//! Newtypes keep dimensions and index kinds from being confused with plain
//! integers, and carry the validation that guards every mutation.

use crate::error::{StoreError, StoreResult};
use crate::types::Position;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest automatically derived IVF partition count.
pub const MAX_AUTO_NLIST: usize = 1024;

/// Type-safe wrapper for vector dimensions.
///
/// Fixed per index generation: every vector added to or searched against an
/// index must have exactly this many components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> StoreResult<Self> {
        if dim == 0 {
            return Err(StoreError::InvalidInput(
                "Vector dimension cannot be zero".to_string(),
            ));
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> StoreResult<()> {
        if vector.len() != self.0 {
            return Err(StoreError::dimension(self.0, vector.len()));
        }
        Ok(())
    }

    /// Validates a whole batch before anything is mutated.
    pub fn validate_batch(&self, vectors: &[Vec<f32>]) -> StoreResult<()> {
        vectors.iter().try_for_each(|v| self.validate_vector(v))
    }

    /// Bytes occupied by `count` vectors of this dimension.
    pub fn bytes_for(&self, count: usize) -> usize {
        count
            .saturating_mul(self.0)
            .saturating_mul(std::mem::size_of::<f32>())
    }
}

impl fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ANN structure variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum IndexKind {
    /// Exhaustive inner-product scan.
    Flat,
    /// Inverted file over k-means partitions. `nlist == 0` derives the
    /// partition count from the training set size.
    IvfFlat { nlist: usize },
}

impl IndexKind {
    /// Parse a kind name: `flat`, `ivf`, `ivfflat`, or `ivf<N>`.
    pub fn parse(name: &str) -> StoreResult<Self> {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "flat" => Ok(Self::Flat),
            "ivf" | "ivfflat" | "ivf_flat" => Ok(Self::IvfFlat { nlist: 0 }),
            other => other
                .strip_prefix("ivf")
                .and_then(|n| n.trim_start_matches(',').parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(|nlist| Self::IvfFlat { nlist })
                .ok_or_else(|| StoreError::UnsupportedIndexKind(name.to_string())),
        }
    }

    /// Exact index below `ivf_threshold` vectors, partitioned at or above it.
    pub fn select(count: usize, ivf_threshold: usize, nlist: usize) -> Self {
        if count >= ivf_threshold {
            Self::IvfFlat { nlist }
        } else {
            Self::Flat
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::IvfFlat { .. })
    }

    /// Tag written into the index file header.
    pub fn tag(&self) -> u32 {
        match self {
            Self::Flat => 0,
            Self::IvfFlat { .. } => 1,
        }
    }

    /// Partition count to train for `count` vectors.
    pub fn effective_nlist(&self, count: usize) -> usize {
        match *self {
            Self::Flat => 1,
            Self::IvfFlat { nlist } if nlist > 0 => nlist.min(count.max(1)),
            Self::IvfFlat { .. } => auto_nlist(count),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::IvfFlat { nlist: 0 } => write!(f, "ivf"),
            Self::IvfFlat { nlist } => write!(f, "ivf{nlist}"),
        }
    }
}

/// √n partitions, clamped to `1..=MAX_AUTO_NLIST`.
pub fn auto_nlist(count: usize) -> usize {
    ((count as f64).sqrt().round() as usize).clamp(1, MAX_AUTO_NLIST)
}

/// Where the index's working data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Residency {
    #[default]
    Cpu,
    Gpu,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// One raw ANN result: a position and its inner-product score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: Position,
    pub score: f32,
}

/// Scale `vector` to unit length in place. Zero vectors are left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Unit-length copy of `vector`.
pub fn normalized(vector: &[f32]) -> Vec<f32> {
    let mut out = vector.to_vec();
    normalize(&mut out);
    out
}
