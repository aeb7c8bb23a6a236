//! The narrow boundary to the external super-resolution model.
//!
//! The model itself is an opaque collaborator behind the [`InferenceAdapter`]
//! trait: a batch of RGBA tiles goes in, the same number of upscaled tiles
//! comes out in the same order. [`ProcessUpscaler`] drives a
//! `waifu2x-ncnn-vulkan` executable; the `mock` feature adds an in-memory
//! adapter for tests.

pub mod error;
#[cfg(feature = "mock")]
mod mock;
mod params;
mod process;

use crate::error::Result;
use async_trait::async_trait;
use image::RgbaImage;
#[cfg(feature = "mock")]
pub use crate::mock::{MockUpscaler, upscale_nearest};
pub use crate::params::{Device, InferenceParameters, Method, ModelVariant, NoiseLevel};
pub use crate::process::ProcessUpscaler;
use std::sync::Arc;

pub type AdapterHandle = Arc<dyn InferenceAdapter + Send + Sync>;

/// Access to an upscaling model.
///
/// # Batch failure policy
/// A batch succeeds or fails as a whole: an implementation either returns
/// exactly one output per input, in input order, or an error. It never
/// returns partial results, and a failing tile must not alter the outputs of
/// its siblings. Callers that need to know *which* tile failed split the
/// batch and dispatch again.
#[async_trait]
pub trait InferenceAdapter {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Factor by which the model multiplies tile dimensions for `params`.
    /// Constant for a given set of parameters.
    fn scale_factor(&self, params: &InferenceParameters) -> u32 {
        params.scale_factor()
    }

    /// Smallest tile overlap, in source pixels, that avoids seams for the
    /// model selected by `params`.
    fn min_overlap(&self, _params: &InferenceParameters) -> u32 {
        0
    }

    /// Upscale every tile of the batch.
    async fn infer_batch(&self, tiles: Vec<RgbaImage>, params: &InferenceParameters) -> Result<Vec<RgbaImage>>;
}
