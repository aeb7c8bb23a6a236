//! Tiling Error Types

use crate::Dimensions;
use derive_more::{Display, Error};

/// A tiling error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for tiling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Tiling failures are invariant violations: either the configuration is
/// inconsistent or the tiles handed back do not belong to the plan. None of
/// them go away on retry.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The image has zero width or height.
    #[display("image has no pixels")]
    EmptyImage,
    /// The tile size leaves no interior once the overlap is taken off both
    /// sides.
    #[display("tile size {tile_size} must be larger than twice the overlap ({overlap})")]
    InvalidTileSize { tile_size: u32, overlap: u32 },
    /// A tile's region does not lie inside the image, or its interior does
    /// not lie inside its region.
    #[display("tile {_0} lies outside the image")]
    OutOfBounds(#[error(not(source))] usize),
    /// An upscaled tile does not have the size of its region times the scale
    /// factor.
    #[display("tile {index} is {actual}, expected {expected}")]
    TileSizeMismatch { index: usize, expected: Dimensions, actual: Dimensions },
    /// Part of the image is not covered by any tile.
    #[display("pixel ({x}, {y}) is not covered by any tile")]
    IncompleteCoverage { x: u32, y: u32 },
    /// The scale factor is zero or overflows the output dimensions.
    #[display("invalid scale factor: {_0}")]
    InvalidScale(#[error(not(source))] u32),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
