use crate::error::{ErrorKind, Result};
use crate::{Device, InferenceAdapter, InferenceParameters, Method, ModelVariant};
use async_trait::async_trait;
use exn::ResultExt;
use image::{ImageFormat, RgbaImage};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::instrument;

const EXECUTABLE: &str = "waifu2x-ncnn-vulkan";
// Lowercased fragments the executable (and the Vulkan loader) print when the
// device runs out of memory.
const OOM_MARKERS: [&str; 3] = ["vkallocatememory failed", "out of memory", "out_of_device_memory"];

/// Upscales batches by running a `waifu2x-ncnn-vulkan` executable.
///
/// Every batch is written as numbered PNG files into a temporary input
/// directory and processed by a single invocation, which writes the same
/// file names into an output directory.
#[derive(Clone, Debug)]
pub struct ProcessUpscaler {
    executable: PathBuf,
    models_dir: Option<PathBuf>,
}
impl ProcessUpscaler {
    /// Locate the executable: `executable` when given (a path, or a name to
    /// look up on `PATH`), otherwise `waifu2x-ncnn-vulkan` on `PATH`.
    ///
    /// Failing to find it is [`Unavailable`](ErrorKind::Unavailable), which
    /// callers treat as fatal to the whole run.
    pub fn discover(executable: Option<&Path>, models_dir: Option<&Path>) -> Result<Self> {
        let wanted = executable.unwrap_or(Path::new(EXECUTABLE));
        let executable = which::which(wanted)
            .or_raise(|| ErrorKind::Unavailable(format!("executable not found: {}", wanted.display())))?;
        if let Some(dir) = models_dir
            && !dir.is_dir()
        {
            exn::bail!(ErrorKind::Unavailable(format!("models directory not found: {}", dir.display())));
        }
        tracing::debug!(executable = %executable.display(), "Discovered upscaler executable");
        Ok(Self { executable, models_dir: models_dir.map(Path::to_path_buf) })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn model_dir_name(model: ModelVariant) -> &'static str {
        match model {
            ModelVariant::Art => "models-cunet",
            ModelVariant::ArtScan => "models-upconv_7_anime_style_art_rgb",
            ModelVariant::Photo => "models-upconv_7_photo",
        }
    }

    fn arguments(&self, params: &InferenceParameters, input: &Path, output: &Path) -> Vec<OsString> {
        let model = Self::model_dir_name(params.model);
        let model = match &self.models_dir {
            Some(dir) => dir.join(model).into_os_string(),
            None => OsString::from(model),
        };
        let gpu = match params.device {
            Device::Cpu => "-1",
            Device::Cuda | Device::Mps => "0",
        };
        let scale = match params.method {
            Method::Scale2x => "2",
            Method::Scale4x => "4",
            Method::Noise => "1",
        };
        vec![
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
            "-s".into(),
            scale.into(),
            "-n".into(),
            params.noise_level.to_string().into(),
            "-m".into(),
            model,
            "-g".into(),
            gpu.into(),
            // Tiling happens before the batch reaches us; let the executable
            // pick its own internal tile size for the device.
            "-t".into(),
            "0".into(),
            "-f".into(),
            "png".into(),
        ]
    }

    fn tile_name(index: usize) -> String {
        format!("{index:06}.png")
    }
}

#[async_trait]
impl InferenceAdapter for ProcessUpscaler {
    fn name(&self) -> &str {
        EXECUTABLE
    }

    fn min_overlap(&self, params: &InferenceParameters) -> u32 {
        // Receptive field padding of the network architectures.
        match params.model {
            ModelVariant::Art => 18,
            ModelVariant::ArtScan | ModelVariant::Photo => 7,
        }
    }

    #[instrument(skip_all, fields(tiles = tiles.len()))]
    async fn infer_batch(&self, tiles: Vec<RgbaImage>, params: &InferenceParameters) -> Result<Vec<RgbaImage>> {
        if tiles.is_empty() {
            return Ok(Vec::new());
        }
        let scale = self.scale_factor(params);
        let expected = tiles.iter().map(|t| (t.width() * scale, t.height() * scale)).collect::<Vec<_>>();
        let workdir = tempfile::Builder::new().prefix("comicup-").tempdir().or_raise(|| ErrorKind::Io)?;
        let input = workdir.path().join("in");
        let output = workdir.path().join("out");
        tokio::fs::create_dir(&input).await.or_raise(|| ErrorKind::Io)?;
        tokio::fs::create_dir(&output).await.or_raise(|| ErrorKind::Io)?;

        let write_dir = input.clone();
        tokio::task::spawn_blocking(move || {
            for (index, tile) in tiles.iter().enumerate() {
                tile.save_with_format(write_dir.join(Self::tile_name(index)), ImageFormat::Png)
                    .or_raise(|| ErrorKind::Io)?;
            }
            Ok::<_, crate::error::Error>(())
        })
        .await
        .or_raise(|| ErrorKind::Io)??;

        let result = Command::new(&self.executable)
            .args(self.arguments(params, &input, &output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .or_raise(|| ErrorKind::Unavailable(format!("cannot run {}", self.executable.display())))?;
        let stderr = String::from_utf8_lossy(&result.stderr).to_lowercase();
        if OOM_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            exn::bail!(ErrorKind::OutOfMemory);
        }
        if !result.status.success() {
            tracing::debug!(stderr = %stderr.trim(), "Upscaler failed");
            exn::bail!(ErrorKind::Failed(result.status.code().unwrap_or(-1)));
        }

        let upscaled = tokio::task::spawn_blocking(move || {
            expected
                .iter()
                .enumerate()
                .map(|(index, &(width, height))| {
                    let name = Self::tile_name(index);
                    let tile = image::open(output.join(&name))
                        .or_raise(|| ErrorKind::MalformedOutput(format!("missing or unreadable tile {name}")))?
                        .into_rgba8();
                    if tile.dimensions() != (width, height) {
                        exn::bail!(ErrorKind::MalformedOutput(format!(
                            "tile {name} is {}x{}, expected {width}x{height}",
                            tile.width(),
                            tile.height()
                        )));
                    }
                    Ok(tile)
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .or_raise(|| ErrorKind::Io)??;
        drop(workdir);
        Ok(upscaled)
    }
}
