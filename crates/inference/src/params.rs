use crate::error::{Error, ErrorKind, Result};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::num::{NonZeroU32, NonZeroUsize};
use std::str::FromStr;

/// Execution backend for the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Device {
    Cpu,
    Cuda,
    /// Apple Metal
    Mps,
}
impl Default for Device {
    /// `mps` on macOS, `cuda` everywhere else.
    fn default() -> Self {
        if cfg!(target_os = "macos") { Device::Mps } else { Device::Cuda }
    }
}
impl Device {
    pub const ALL: [Device; 3] = [Device::Cpu, Device::Cuda, Device::Mps];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
        }
    }
}

/// Pretrained model family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ModelVariant {
    /// Clean digital artwork
    Art,
    /// Scanned print artwork
    #[default]
    ArtScan,
    Photo,
}
impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [ModelVariant::Art, ModelVariant::ArtScan, ModelVariant::Photo];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Art => "art",
            ModelVariant::ArtScan => "art_scan",
            ModelVariant::Photo => "photo",
        }
    }
}

/// Upscaling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Method {
    #[default]
    Scale2x,
    Scale4x,
    /// Denoise only, keeping the original size.
    Noise,
}
impl Method {
    pub const ALL: [Method; 3] = [Method::Scale2x, Method::Scale4x, Method::Noise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Scale2x => "scale2x",
            Method::Scale4x => "scale4x",
            Method::Noise => "noise",
        }
    }

    /// Factor by which this method multiplies both image dimensions.
    #[inline]
    pub const fn scale_factor(&self) -> u32 {
        match self {
            Method::Scale2x => 2,
            Method::Scale4x => 4,
            Method::Noise => 1,
        }
    }
}

/// Denoising strength: `-1` disables denoising, `0..=3` are increasingly
/// aggressive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "i8", into = "i8"))]
pub struct NoiseLevel(i8);
impl NoiseLevel {
    pub const DISABLED: NoiseLevel = NoiseLevel(-1);
    pub const MIN: i8 = -1;
    pub const MAX: i8 = 3;

    #[inline]
    pub const fn get(&self) -> i8 {
        self.0
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.0 >= 0
    }
}
impl Default for NoiseLevel {
    fn default() -> Self {
        Self::DISABLED
    }
}
impl TryFrom<i8> for NoiseLevel {
    type Error = Error;
    fn try_from(level: i8) -> std::result::Result<Self, Self::Error> {
        if !(Self::MIN..=Self::MAX).contains(&level) {
            exn::bail!(ErrorKind::InvalidParameters(format!(
                "noise level {level} is outside {}..={}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(level))
    }
}
impl From<NoiseLevel> for i8 {
    fn from(level: NoiseLevel) -> Self {
        level.0
    }
}

macro_rules! str_enum {
    ($($ty:ident => $what:literal),* $(,)?) => {$(
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                write!(f, "{}", self.as_str())
            }
        }
        impl FromStr for $ty {
            type Err = Error;
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let lowered = s.to_lowercase();
                match Self::ALL.into_iter().find(|v| v.as_str() == lowered) {
                    Some(value) => Ok(value),
                    None => exn::bail!(ErrorKind::InvalidParameters(format!(concat!("unknown ", $what, ": {}"), s))),
                }
            }
        }
    )*};
}
str_enum!(Device => "device", ModelVariant => "model variant", Method => "method");

impl Display for NoiseLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}
impl FromStr for NoiseLevel {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let Ok(level) = s.trim().parse::<i8>() else {
            exn::bail!(ErrorKind::InvalidParameters(format!("noise level is not an integer: {s}")));
        };
        NoiseLevel::try_from(level)
    }
}

/// Immutable inference configuration, constructed once per run and shared by
/// every component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InferenceParameters {
    pub device: Device,
    pub model: ModelVariant,
    pub method: Method,
    pub noise_level: NoiseLevel,
    /// Maximum tile side in source pixels; `None` sends whole pages.
    pub tile_size: Option<NonZeroU32>,
    /// Maximum tiles per inference call; `None` sends one page per call.
    pub batch_size: Option<NonZeroUsize>,
}
impl InferenceParameters {
    /// Reject combinations the model cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.method == Method::Noise && !self.noise_level.is_enabled() {
            exn::bail!(ErrorKind::InvalidParameters(
                "method `noise` requires a noise level between 0 and 3".to_string()
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn scale_factor(&self) -> u32 {
        self.method.scale_factor()
    }
}
