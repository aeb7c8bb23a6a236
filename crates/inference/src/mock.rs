//! In-memory upscaler for testing.

use crate::error::{ErrorKind, Result};
use crate::{InferenceAdapter, InferenceParameters};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Nearest-neighbour upscaler with failure injection.
///
/// Every pixel is repeated `scale` times in both directions, so results are
/// exact and tiled upscaling matches whole-image upscaling. Every dispatched
/// batch is recorded.
///
/// # Examples
///
/// ```
/// use comicup_inference::{InferenceAdapter, InferenceParameters, MockUpscaler};
/// use image::RgbaImage;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mock = MockUpscaler::new().fail_next(1);
/// let params = InferenceParameters::default();
/// assert!(mock.infer_batch(vec![RgbaImage::new(2, 2)], &params).await.is_err());
/// let out = mock.infer_batch(vec![RgbaImage::new(2, 2)], &params).await.unwrap();
/// assert_eq!(out[0].dimensions(), (4, 4));
/// assert_eq!(mock.batches().await, vec![1, 1]);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MockUpscaler {
    transient_failures: AtomicUsize,
    poison: Option<Rgba<u8>>,
    min_overlap: u32,
    batches: Mutex<Vec<usize>>,
}

impl MockUpscaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` batches with [`OutOfMemory`](ErrorKind::OutOfMemory),
    /// which is retryable.
    pub fn fail_next(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every batch containing a tile with this pixel value with
    /// [`UnsupportedInput`](ErrorKind::UnsupportedInput), which is not
    /// retryable.
    pub fn poison(mut self, pixel: Rgba<u8>) -> Self {
        self.poison = Some(pixel);
        self
    }

    pub fn with_min_overlap(mut self, overlap: u32) -> Self {
        self.min_overlap = overlap;
        self
    }

    /// Sizes of every batch dispatched so far, failed ones included.
    pub async fn batches(&self) -> Vec<usize> {
        self.batches.lock().await.clone()
    }
}

/// Repeat every pixel `scale` times horizontally and vertically.
pub fn upscale_nearest(image: &RgbaImage, scale: u32) -> RgbaImage {
    RgbaImage::from_fn(image.width() * scale, image.height() * scale, |x, y| *image.get_pixel(x / scale, y / scale))
}

#[async_trait]
impl InferenceAdapter for MockUpscaler {
    fn name(&self) -> &str {
        "mock"
    }

    fn min_overlap(&self, _params: &InferenceParameters) -> u32 {
        self.min_overlap
    }

    async fn infer_batch(&self, tiles: Vec<RgbaImage>, params: &InferenceParameters) -> Result<Vec<RgbaImage>> {
        self.batches.lock().await.push(tiles.len());
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok();
        if transient {
            exn::bail!(ErrorKind::OutOfMemory);
        }
        if let Some(poison) = self.poison
            && let Some(index) = tiles.iter().position(|tile| tile.pixels().any(|pixel| *pixel == poison))
        {
            exn::bail!(ErrorKind::UnsupportedInput(format!("tile {index} is poisoned")));
        }
        let scale = self.scale_factor(params);
        Ok(tiles.iter().map(|tile| upscale_nearest(tile, scale)).collect())
    }
}
