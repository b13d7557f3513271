use crate::cell::BoxError;
use thiserror::Error;

/// Broad classes of whole-call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected when building an engine or finder; the instance is unusable.
    Configuration,
    /// Rejected by a compute call before any output was touched.
    InvalidInput,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Invalid box: {0}")]
    Box(#[from] BoxError),
    #[error("Cutoff must be positive and finite, got {0}")]
    InvalidCutoff(f64),
    #[error("Search radius must be positive and finite, got {0}")]
    InvalidSearchRadius(f64),
    #[error("Number of nearest neighbors must be positive")]
    ZeroNeighborCount,
    #[error("Minimum neighbor count must be positive")]
    ZeroMinNeighbors,
    #[error("Cutoff {cutoff} exceeds {limit} ({ratio} times the smallest periodic box width)")]
    CutoffTooLarge { cutoff: f64, limit: f64, ratio: f64 },
    #[error("Spherical harmonic degree must be non-negative, got {0}")]
    NegativeDegree(i64),
    #[error("Particle {index} has a non-finite coordinate")]
    NonFinitePosition { index: usize },
    #[error("Particle {index} has non-zero z in a two-dimensional box")]
    OutOfPlane { index: usize },
    #[error("Positions must have 2 or 3 columns, got {0}")]
    UnsupportedDimension(usize),
    #[error("Coordinate buffer of length {len} is not a multiple of {dim}")]
    RaggedPositions { len: usize, dim: usize },
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Box(_)
            | Self::InvalidCutoff(_)
            | Self::InvalidSearchRadius(_)
            | Self::ZeroNeighborCount
            | Self::ZeroMinNeighbors
            | Self::CutoffTooLarge { .. }
            | Self::NegativeDegree(_) => ErrorKind::Configuration,
            Self::NonFinitePosition { .. }
            | Self::OutOfPlane { .. }
            | Self::UnsupportedDimension(_)
            | Self::RaggedPositions { .. } => ErrorKind::InvalidInput,
        }
    }
}
