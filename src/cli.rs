use clap::{ArgAction, Parser};
use comicup_inference::error::Error as InferenceError;
use comicup_inference::{Device, Method, ModelVariant, NoiseLevel};
use figment::Figment;
use figment::providers::Serialized;
use std::path::PathBuf;
use std::str::FromStr;

fn parse_value<T: FromStr<Err = InferenceError>>(s: &str) -> Result<T, String> {
    s.parse::<T>().map_err(|e| e.to_string())
}

/// Upscale every page of comic book archives with an external model.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A comic archive, or a directory of comic archives.
    pub path: PathBuf,

    /// Execution backend: cpu, cuda or mps.
    #[arg(long, value_parser = parse_value::<Device>)]
    pub device: Option<Device>,

    /// Model family: art, art_scan or photo.
    #[arg(long, alias = "model_type", value_parser = parse_value::<ModelVariant>)]
    pub model_type: Option<ModelVariant>,

    /// Upscaling method: scale2x, scale4x or noise.
    #[arg(long, value_parser = parse_value::<Method>)]
    pub method: Option<Method>,

    /// Denoising level from 0 to 3, or -1 to disable.
    #[arg(long, alias = "noise_level", allow_negative_numbers = true, value_parser = parse_value::<NoiseLevel>)]
    pub noise_level: Option<NoiseLevel>,

    /// Maximum tile side in pixels. Pages are upscaled whole when unset.
    #[arg(long, alias = "tile_size", value_parser = clap::value_parser!(u32).range(1..))]
    pub tile_size: Option<u32>,

    /// Maximum tiles per inference call. One page per call when unset.
    #[arg(long, alias = "batch_size", value_parser = clap::value_parser!(u64).range(1..))]
    pub batch_size: Option<u64>,

    /// Configuration file (toml, yaml or json).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Directory under which archives are extracted while they are processed.
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Number of archives prepared ahead of the one being upscaled.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub queue_depth: Option<u64>,

    /// Marker appended to the name of every upscaled archive.
    #[arg(long)]
    pub output_suffix: Option<String>,

    /// Upscaler executable, when it is not on PATH.
    #[arg(long)]
    pub upscaler: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Layer the flags that were given on top of the loaded configuration.
    pub fn apply(&self, mut figment: Figment) -> Figment {
        fn set<T: serde::Serialize>(figment: Figment, key: &'static str, value: Option<T>) -> Figment {
            match value {
                Some(value) => figment.merge(Serialized::default(key, value)),
                None => figment,
            }
        }
        figment = set(figment, "inference.device", self.device);
        figment = set(figment, "inference.model", self.model_type);
        figment = set(figment, "inference.method", self.method);
        figment = set(figment, "inference.noise_level", self.noise_level);
        figment = set(figment, "inference.tile_size", self.tile_size);
        figment = set(figment, "inference.batch_size", self.batch_size);
        figment = set(figment, "inference.executable", self.upscaler.as_ref());
        figment = set(figment, "pipeline.staging_dir", self.staging_dir.as_ref());
        figment = set(figment, "pipeline.queue_depth", self.queue_depth);
        set(figment, "pipeline.output_suffix", self.output_suffix.as_ref())
    }
}
