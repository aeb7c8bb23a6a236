//! Layered configuration for comicup.
//!
//! Sources, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. The user configuration file, `config.toml` in the platform
//!    configuration directory (e.g. `~/.config/comicup/config.toml`)
//! 3. An explicit configuration file (`.toml`, `.yaml`/`.yml` or `.json`)
//! 4. Environment variables prefixed with `COMICUP_`, nested keys separated
//!    by `__` (e.g. `COMICUP_INFERENCE__DEVICE=cpu`)
//!
//! Command-line flags are merged on top of [`Config::figment`] by the binary.

pub mod error;

use crate::error::{ErrorKind, Result};
use comicup_archive::{ArchiveFormat, EntryCompression};
use comicup_inference::{Device, InferenceParameters, Method, ModelVariant, NoiseLevel};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "COMICUP_";
const USER_CONFIG_FILE: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "comicup", "comicup")
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: Device,
    pub model: ModelVariant,
    pub method: Method,
    pub noise_level: NoiseLevel,
    /// Maximum tile side in pixels; unset sends whole pages to the model.
    pub tile_size: Option<u32>,
    /// Maximum tiles per inference call; unset sends one page per call.
    pub batch_size: Option<usize>,
    /// Overlap margin around each tile, in source pixels. Raised to the
    /// model's own minimum when smaller.
    pub overlap: u32,
    /// Retries of a failing batch before it is split up.
    pub max_retries: u32,
    /// Upscaler executable; looked up on `PATH` when unset.
    pub executable: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
}
impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            model: ModelVariant::default(),
            method: Method::default(),
            noise_level: NoiseLevel::default(),
            tile_size: None,
            batch_size: None,
            overlap: 32,
            max_retries: 2,
            executable: None,
            models_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Marker appended to the archive stem to name the output.
    pub output_suffix: String,
    pub output_format: ArchiveFormat,
    pub entry_compression: EntryCompression,
    /// Root for staging directories; the platform cache directory when unset.
    pub staging_dir: Option<PathBuf>,
    /// Archives staged ahead of the one being upscaled.
    pub queue_depth: usize,
    /// Quality used when re-encoding JPEG pages.
    pub jpeg_quality: u8,
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_suffix: " (upscaled)".to_string(),
            output_format: ArchiveFormat::Cbz,
            entry_compression: EntryCompression::None,
            staging_dir: None,
            queue_depth: 2,
            jpeg_quality: 95,
        }
    }
}

impl Config {
    /// The layered configuration sources, ready for extra providers to be
    /// merged on top.
    pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
        let user = project_dirs().map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE));
        Self::figment_from(user.as_deref(), explicit)
    }

    fn figment_from(user: Option<&Path>, explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(user) = user {
            // A missing user file is not an error; Toml::file skips it.
            tracing::trace!(path = %user.display(), "Including user configuration file");
            figment = figment.merge(Toml::file(user));
        }
        if let Some(path) = explicit {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            let extension = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFile(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate a configuration.
    pub fn extract(figment: &Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Invalid)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from every source.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::extract(&Self::figment(explicit)?)
    }

    pub fn validate(&self) -> Result<()> {
        let out_of_range = |key, reason: &str| ErrorKind::OutOfRange { key, reason: reason.to_string() };
        let inference = &self.inference;
        if inference.tile_size == Some(0) {
            exn::bail!(out_of_range("inference.tile_size", "must be greater than zero"));
        }
        if let Some(tile_size) = inference.tile_size
            && u64::from(tile_size) <= 2 * u64::from(inference.overlap)
        {
            exn::bail!(out_of_range("inference.tile_size", "must be larger than twice inference.overlap"));
        }
        if inference.batch_size == Some(0) {
            exn::bail!(out_of_range("inference.batch_size", "must be greater than zero"));
        }
        let pipeline = &self.pipeline;
        if pipeline.output_suffix.trim().is_empty() {
            exn::bail!(out_of_range("pipeline.output_suffix", "must not be empty"));
        }
        if !pipeline.output_format.is_writable() {
            exn::bail!(out_of_range("pipeline.output_format", "format is read-only"));
        }
        if pipeline.queue_depth == 0 {
            exn::bail!(out_of_range("pipeline.queue_depth", "must be greater than zero"));
        }
        if !(1..=100).contains(&pipeline.jpeg_quality) {
            exn::bail!(out_of_range("pipeline.jpeg_quality", "must be between 1 and 100"));
        }
        self.inference_parameters().map(|_| ())
    }

    /// The immutable inference parameters for this run.
    pub fn inference_parameters(&self) -> Result<InferenceParameters> {
        let inference = &self.inference;
        let params = InferenceParameters {
            device: inference.device,
            model: inference.model,
            method: inference.method,
            noise_level: inference.noise_level,
            tile_size: inference.tile_size.and_then(NonZeroU32::new),
            batch_size: inference.batch_size.and_then(NonZeroUsize::new),
        };
        params.validate().map_err(|e| {
            let reason = e.to_string();
            e.raise(ErrorKind::OutOfRange { key: "inference.method", reason })
        })?;
        Ok(params)
    }

    /// Directory under which archives are staged.
    pub fn staging_root(&self) -> PathBuf {
        match &self.pipeline.staging_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()
                .map(|dirs| dirs.cache_dir().join("staging"))
                .unwrap_or_else(|| std::env::temp_dir().join("comicup-staging")),
        }
    }
}
