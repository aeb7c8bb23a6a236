//! Splitting page images into overlapping tiles and stitching upscaled tiles
//! back together.
//!
//! Every [`Tile`] has two rectangles. Its **interior** is the part of the
//! image the tile is responsible for; interiors of a plan partition the image
//! exactly, without gaps or overlaps. Its **region** is the interior grown by
//! the overlap margin on every side (clamped to the image) and is what gets
//! sent to the model, so that pixels near an interior edge still see their
//! neighbours. When recomposing, each output pixel is taken from the tile
//! whose interior contains it; overlap pixels outside an interior are
//! truncated. The result is deterministic and free of blending artifacts.
//!
//! ```
//! use comicup_tiling::{Dimensions, plan, recompose};
//! use std::num::NonZeroU32;
//!
//! let page = image::RgbaImage::from_fn(300, 200, |x, y| image::Rgba([x as u8, y as u8, 0, 255]));
//! let tiles = plan(Dimensions::of(&page), NonZeroU32::new(128), 16).unwrap();
//! let results = tiles.iter().map(|tile| (*tile, tile.extract(&page))).collect::<Vec<_>>();
//! assert_eq!(recompose(Dimensions::of(&page), 1, results).unwrap(), page);
//! ```

pub mod error;
mod plan;
mod recompose;

pub use crate::plan::plan;
pub use crate::recompose::recompose;
use derive_more::Display;
use image::{GenericImageView, RgbaImage};

/// Width and height of an image, in pixels.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("{width}x{height}")]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}
impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(image: &impl GenericImageView) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Dimensions multiplied by `scale`, or `None` on overflow.
    pub fn scaled(&self, scale: u32) -> Option<Self> {
        Some(Self { width: self.width.checked_mul(scale)?, height: self.height.checked_mul(scale)? })
    }
}

/// An axis-aligned rectangle in image coordinates.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("{width}x{height}+{x}+{y}")]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}
impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && u64::from(other.x) + u64::from(other.width) <= u64::from(self.x) + u64::from(self.width)
            && u64::from(other.y) + u64::from(other.height) <= u64::from(self.y) + u64::from(self.height)
    }
}

/// One unit of inference work: a region of a page plus the interior it is
/// responsible for. `index` is the tile's position in its plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    pub index: usize,
    pub region: Rect,
    pub interior: Rect,
}
impl Tile {
    /// Crop this tile's region out of `image`. A region reaching past the
    /// edges of `image` is clipped.
    pub fn extract(&self, image: &RgbaImage) -> RgbaImage {
        let Rect { x, y, width, height } = self.region;
        image::imageops::crop_imm(image, x, y, width, height).to_image()
    }
}
