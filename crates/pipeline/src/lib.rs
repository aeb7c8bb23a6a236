//! Batch upscaling of comic archives.
//!
//! [`ComicPipeline`] ties the workspace together: it discovers archives,
//! skips those already upscaled, stages each one into a crash-safe
//! directory, cuts its pages into tiles, pushes the tiles through the
//! [`InferenceAdapter`](comicup_inference::InferenceAdapter) in batches, and
//! packs the reassembled pages into a new archive next to the original.
//! Source archives are never modified.
//!
//! A failure is confined to the archive it happened in and reported in the
//! [`Summary`]; only configuration problems end a run early.

mod codec;
mod discover;
pub mod error;
mod scheduler;
mod state;
mod summary;

use crate::error::{ErrorKind, Result};
pub use crate::codec::IMAGE_EXTENSIONS;
pub use crate::discover::{discover, is_upscaled, output_path, output_paths};
pub use crate::error::FailureKind;
pub use crate::scheduler::BatchScheduler;
pub use crate::state::ArchiveState;
pub use crate::summary::{ArchiveResult, ArchiveStatus, Failure, PageFailure, SkipReason, Summary};
use comicup_archive::{ArchiveFormat, EntryCompression};
use comicup_config::Config;
use comicup_inference::AdapterHandle;
use comicup_staging::StagingArea;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Pipeline behaviour that is not part of the inference parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub overlap: u32,
    pub max_retries: u32,
    pub output_suffix: String,
    pub output_format: ArchiveFormat,
    pub entry_compression: EntryCompression,
    pub queue_depth: usize,
    pub jpeg_quality: u8,
}
impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            overlap: config.inference.overlap,
            max_retries: config.inference.max_retries,
            output_suffix: config.pipeline.output_suffix.clone(),
            output_format: config.pipeline.output_format,
            entry_compression: config.pipeline.entry_compression,
            queue_depth: config.pipeline.queue_depth,
            jpeg_quality: config.pipeline.jpeg_quality,
        }
    }
}

pub struct ComicPipeline {
    scheduler: BatchScheduler,
}
impl ComicPipeline {
    /// Validate `config` and prepare the staging root. Any error here is
    /// fatal to the run.
    pub fn new(config: &Config, adapter: AdapterHandle) -> Result<Self> {
        let configuration = |e: comicup_config::error::Error| {
            let reason = e.to_string();
            e.raise(ErrorKind::Configuration(reason))
        };
        config.validate().map_err(configuration)?;
        let params = config.inference_parameters().map_err(configuration)?;
        let root = config.staging_root();
        let staging = StagingArea::new(&root).map_err(|e| e.raise(ErrorKind::Staging(root.clone())))?;
        tracing::debug!(staging = %staging.root().display(), "Staging root ready");
        let scheduler = BatchScheduler::new(adapter, params, Settings::from_config(config), staging)?;
        Ok(Self { scheduler })
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Upscale the archive at `path`, or every archive directly inside the
    /// directory at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn run_on_path(&self, path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<Summary> {
        let archives = discover(path.as_ref()).await?;
        tracing::info!(archives = archives.len(), "Starting run");
        let summary = self.scheduler.run(archives, cancel).await;
        tracing::info!(%summary, "Run complete");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use comicup_archive::Page;
    use comicup_inference::error::Result as InferenceResult;
    use comicup_inference::{InferenceAdapter, InferenceParameters, MockUpscaler, upscale_nearest};
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const POISON: Rgba<u8> = Rgba([255, 0, 255, 255]);

    struct Fixture {
        library: TempDir,
        staging: TempDir,
        config: Config,
    }
    impl Fixture {
        fn new() -> Self {
            let library = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.pipeline.staging_dir = Some(staging.path().to_path_buf());
            config.inference.overlap = 2;
            Self { library, staging, config }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.library.path().join(name)
        }

        fn archive(&self, name: &str, pages: &[Page]) -> PathBuf {
            let path = self.path(name);
            ArchiveFormat::from_path(&path).unwrap().write(&path, pages, EntryCompression::None).unwrap();
            path
        }

        fn pipeline(&self, adapter: AdapterHandle) -> ComicPipeline {
            ComicPipeline::new(&self.config, adapter).unwrap()
        }

        async fn run(&self, adapter: AdapterHandle) -> Summary {
            self.pipeline(adapter).run_on_path(self.library.path(), &CancellationToken::new()).await.unwrap()
        }

        fn staging_is_empty(&self) -> bool {
            std::fs::read_dir(self.staging.path()).unwrap().next().is_none()
        }
    }

    fn picture(width: u32, height: u32, seed: u8) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x as u8).wrapping_mul(13).wrapping_add(seed), (y as u8).wrapping_mul(7), seed, 255])
        })
    }

    fn png(image: &RgbaImage) -> Vec<u8> {
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(image.clone()).write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).unwrap();
        buffer
    }

    fn book(seed: u8) -> Vec<Page> {
        vec![
            Page::new("001.png", png(&picture(12, 9, seed))),
            Page::new("002.png", png(&picture(7, 11, seed.wrapping_add(1)))),
            Page::new("ComicInfo.xml", b"<ComicInfo><Series>Test</Series></ComicInfo>".to_vec()),
        ]
    }

    fn mock() -> (Arc<MockUpscaler>, AdapterHandle) {
        let mock = Arc::new(MockUpscaler::new());
        (mock.clone(), mock)
    }

    fn names(summary: &Summary) -> Vec<String> {
        summary.results.iter().map(|r| r.archive.file_name().unwrap().to_string_lossy().into_owned()).collect()
    }

    fn assert_upscaled(output: &Path, source: &[Page], scale: u32) {
        let pages = ArchiveFormat::open(output).unwrap();
        assert_eq!(pages.iter().map(|p| &p.path).collect::<Vec<_>>(), source.iter().map(|p| &p.path).collect::<Vec<_>>());
        for (page, original) in pages.iter().zip(source) {
            if page.path.extension().is_some_and(|e| e == "png") {
                let expected = upscale_nearest(&image::load_from_memory(&original.data).unwrap().into_rgba8(), scale);
                assert_eq!(image::load_from_memory(&page.data).unwrap().into_rgba8(), expected, "{}", page.path.display());
            } else {
                assert_eq!(page.data, original.data);
            }
        }
    }

    #[tokio::test]
    async fn test_directory_is_upscaled() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &book(1));
        fixture.archive("b.cbt", &book(2));
        let (mock, adapter) = mock();

        let summary = fixture.run(adapter).await;
        assert_eq!((summary.processed_count(), summary.skipped_count(), summary.failed_count()), (2, 0, 0));
        assert_eq!(summary.exit_code(), 0);
        assert_upscaled(&fixture.path("a (upscaled).cbz"), &book(1), 2);
        assert_upscaled(&fixture.path("b (upscaled).cbz"), &book(2), 2);
        // No batch size: one inference call per page.
        assert_eq!(mock.batches().await, vec![1, 1, 1, 1]);
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &book(1));
        fixture.archive("b.cbz", &book(2));
        let first = fixture.run(mock().1).await;
        assert_eq!(first.processed_count(), 2);
        let output = std::fs::read(fixture.path("a (upscaled).cbz")).unwrap();

        let (mock, adapter) = mock();
        let second = fixture.run(adapter).await;
        assert_eq!(second.processed_count(), 0);
        assert_eq!(second.skipped_count(), 4);
        assert_eq!(names(&second), ["a (upscaled).cbz", "a.cbz", "b (upscaled).cbz", "b.cbz"]);
        assert_eq!(
            second.results[1].status,
            ArchiveStatus::Skipped(SkipReason::OutputExists(fixture.path("a (upscaled).cbz")))
        );
        assert_eq!(second.results[0].status, ArchiveStatus::Skipped(SkipReason::AlreadyUpscaled));
        assert!(mock.batches().await.is_empty());
        assert_eq!(std::fs::read(fixture.path("a (upscaled).cbz")).unwrap(), output);
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_archives_sharing_a_stem_get_their_own_outputs() {
        let fixture = Fixture::new();
        fixture.archive("a.cbt", &book(1));
        fixture.archive("a.cbz", &book(2));

        let first = fixture.run(mock().1).await;
        assert_eq!((first.processed_count(), first.failed_count()), (2, 0));
        assert_upscaled(&fixture.path("a.cbt (upscaled).cbz"), &book(1), 2);
        assert_upscaled(&fixture.path("a.cbz (upscaled).cbz"), &book(2), 2);
        assert!(!fixture.path("a (upscaled).cbz").exists());

        let (mock, adapter) = mock();
        let second = fixture.run(adapter).await;
        assert_eq!(names(&second), ["a.cbt", "a.cbt (upscaled).cbz", "a.cbz", "a.cbz (upscaled).cbz"]);
        assert_eq!(
            second.results[0].status,
            ArchiveStatus::Skipped(SkipReason::OutputExists(fixture.path("a.cbt (upscaled).cbz")))
        );
        assert_eq!(
            second.results[2].status,
            ArchiveStatus::Skipped(SkipReason::OutputExists(fixture.path("a.cbz (upscaled).cbz")))
        );
        assert_eq!(second.skipped_count(), 4);
        assert!(mock.batches().await.is_empty());
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_single_archive_is_processed() {
        let fixture = Fixture::new();
        let archive = fixture.archive("a.cbz", &book(1));
        let pipeline = fixture.pipeline(mock().1);

        let result = pipeline.scheduler().process(archive.clone(), &CancellationToken::new()).await;
        assert_eq!(result.archive, archive);
        assert_eq!(result.status, ArchiveStatus::Processed { output: fixture.path("a (upscaled).cbz"), pages: 2 });
        assert_upscaled(&fixture.path("a (upscaled).cbz"), &book(1), 2);

        let again = pipeline.scheduler().process(archive.clone(), &CancellationToken::new()).await;
        assert!(matches!(again.status, ArchiveStatus::Skipped(SkipReason::OutputExists(_))));
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_output_is_deterministic() {
        let first = Fixture::new();
        let second = Fixture::new();
        for fixture in [&first, &second] {
            fixture.archive("a.cbz", &book(9));
            fixture.run(mock().1).await;
        }
        assert_eq!(
            std::fs::read(first.path("a (upscaled).cbz")).unwrap(),
            std::fs::read(second.path("a (upscaled).cbz")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_isolated() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &book(1));
        std::fs::write(fixture.path("b.cbz"), b"this is not a zip file at all").unwrap();
        fixture.archive("c.cbz", &book(3));

        let summary = fixture.run(mock().1).await;
        assert_eq!(names(&summary), ["a.cbz", "b.cbz", "c.cbz"]);
        assert_eq!((summary.processed_count(), summary.failed_count()), (2, 1));
        let failures = summary.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, &fixture.path("b.cbz"));
        assert_eq!(failures[0].1.kind, FailureKind::CorruptArchive);
        assert!(!fixture.path("b (upscaled).cbz").exists());
        assert_eq!(summary.exit_code(), 0);
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_everything_failing_is_a_failed_run() {
        let fixture = Fixture::new();
        std::fs::write(fixture.path("a.cbz"), b"garbage").unwrap();
        std::fs::write(fixture.path("b.cbt"), b"garbage").unwrap();
        let summary = fixture.run(mock().1).await;
        assert_eq!(summary.failed_count(), 2);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_failing_page_is_isolated_within_a_mixed_batch() {
        let mut fixture = Fixture::new();
        fixture.config.inference.batch_size = Some(8);
        let mut poisoned = picture(6, 6, 4);
        poisoned.put_pixel(3, 3, POISON);
        let a = vec![Page::new("001.png", png(&picture(6, 6, 3))), Page::new("002.png", png(&poisoned))];
        fixture.archive("a.cbz", &a);
        fixture.archive("b.cbz", &book(5));
        let mock = Arc::new(MockUpscaler::new().poison(POISON));

        let summary = fixture.run(mock.clone()).await;
        // All four pages share one batch, which is then split per page.
        assert_eq!(mock.batches().await, vec![4, 1, 1, 1, 1]);
        assert_eq!(names(&summary), ["a.cbz", "b.cbz"]);
        let ArchiveStatus::Failed(failure) = &summary.results[0].status else {
            panic!("unexpected status: {:?}", summary.results[0].status);
        };
        assert_eq!(failure.kind, FailureKind::Inference);
        assert_eq!(failure.pages.len(), 1);
        assert_eq!(failure.pages[0].page, PathBuf::from("002.png"));
        assert!(!fixture.path("a (upscaled).cbz").exists());
        assert_upscaled(&fixture.path("b (upscaled).cbz"), &book(5), 2);
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &[Page::new("001.png", png(&picture(5, 5, 1)))]);
        let mock = Arc::new(MockUpscaler::new().fail_next(2));
        let summary = fixture.run(mock.clone()).await;
        assert_eq!(summary.processed_count(), 1);
        assert_eq!(mock.batches().await, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &[Page::new("001.png", png(&picture(5, 5, 1)))]);
        let mock = Arc::new(MockUpscaler::new().fail_next(3));
        let summary = fixture.run(mock.clone()).await;
        assert_eq!(summary.failed_count(), 1);
        // Initial attempt plus max_retries (2); a single page is not split.
        assert_eq!(mock.batches().await, vec![1, 1, 1]);
        let (_, failure) = summary.failures().next().unwrap();
        assert!(failure.pages[0].reason.contains("out of memory"));
    }

    #[tokio::test]
    async fn test_tiled_pages_match_whole_page_upscaling() {
        let mut fixture = Fixture::new();
        fixture.config.inference.tile_size = Some(8);
        fixture.config.inference.batch_size = Some(3);
        let pages = vec![
            Page::new("001.png", png(&picture(40, 30, 1))),
            Page::new("002.png", png(&picture(9, 21, 2))),
        ];
        fixture.archive("a.cbz", &pages);
        let (mock, adapter) = mock();

        let summary = fixture.run(adapter).await;
        assert_eq!(summary.processed_count(), 1);
        assert_upscaled(&fixture.path("a (upscaled).cbz"), &pages, 2);
        let batches = mock.batches().await;
        assert!(batches.len() > 2);
        assert!(batches.iter().all(|size| *size <= 3));
    }

    #[tokio::test]
    async fn test_results_keep_discovery_order() {
        let mut fixture = Fixture::new();
        fixture.config.inference.batch_size = Some(5);
        fixture.archive("a (upscaled).cbz", &book(0));
        fixture.archive("b.cbt", &book(1));
        std::fs::write(fixture.path("c.cbz"), b"garbage").unwrap();
        fixture.archive("d.cbz", &book(2));
        fixture.archive("e.cbz", &book(3));

        let summary = fixture.run(mock().1).await;
        assert_eq!(names(&summary), ["a (upscaled).cbz", "b.cbt", "c.cbz", "d.cbz", "e.cbz"]);
        assert!(matches!(summary.results[0].status, ArchiveStatus::Skipped(SkipReason::AlreadyUpscaled)));
        assert!(matches!(summary.results[1].status, ArchiveStatus::Processed { pages: 2, .. }));
        assert!(matches!(summary.results[2].status, ArchiveStatus::Failed(_)));
        assert!(matches!(summary.results[3].status, ArchiveStatus::Processed { .. }));
        assert!(matches!(summary.results[4].status, ArchiveStatus::Processed { .. }));
    }

    #[tokio::test]
    async fn test_interrupted_staging_is_discarded() {
        let fixture = Fixture::new();
        let archive = fixture.archive("a.cbz", &book(1));
        // Leftovers of a crash during extraction: no completion marker.
        let staging = StagingArea::new(fixture.staging.path()).unwrap();
        let leftover = staging.directory_for(&archive).unwrap();
        std::fs::create_dir_all(leftover.join("pages")).unwrap();
        std::fs::write(leftover.join("pages").join("001.png"), b"half a png").unwrap();

        let summary = fixture.run(mock().1).await;
        assert_eq!(summary.processed_count(), 1);
        assert_upscaled(&fixture.path("a (upscaled).cbz"), &book(1), 2);
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_incomplete_output_is_replaced() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &book(1));
        std::fs::write(fixture.path("a (upscaled).cbz"), b"PK\x03\x04 truncated").unwrap();

        let summary = fixture.run(mock().1).await;
        assert_eq!(names(&summary), ["a (upscaled).cbz", "a.cbz"]);
        assert_eq!(summary.processed_count(), 1);
        assert_upscaled(&fixture.path("a (upscaled).cbz"), &book(1), 2);
    }

    #[tokio::test]
    async fn test_undecodable_page_fails_the_archive() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &[Page::new("001.png", png(&picture(4, 4, 1))), Page::new("002.jpg", b"nope".to_vec())]);
        let (mock, adapter) = mock();
        let summary = fixture.run(adapter).await;
        let (_, failure) = summary.failures().next().unwrap();
        assert_eq!(failure.kind, FailureKind::Image);
        assert_eq!(failure.pages[0].page, PathBuf::from("002.jpg"));
        assert!(mock.batches().await.is_empty());
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_jpeg_pages_stay_jpeg() {
        let fixture = Fixture::new();
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(picture(16, 16, 1)).to_rgb8())
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();
        fixture.archive("a.cbz", &[Page::new("001.jpg", jpeg)]);
        fixture.run(mock().1).await;

        let pages = ArchiveFormat::open(fixture.path("a (upscaled).cbz")).unwrap();
        assert_eq!(image::guess_format(&pages[0].data).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image::load_from_memory(&pages[0].data).unwrap().width(), 32);
    }

    #[tokio::test]
    async fn test_single_unsupported_file_is_reported() {
        let fixture = Fixture::new();
        let file = fixture.path("book.pdf");
        std::fs::write(&file, b"%PDF-1.7").unwrap();
        let summary = fixture.pipeline(mock().1).run_on_path(&file, &CancellationToken::new()).await.unwrap();
        let (_, failure) = summary.failures().next().unwrap();
        assert_eq!(failure.kind, FailureKind::UnsupportedFormat);
    }

    #[tokio::test]
    async fn test_missing_path_is_fatal() {
        let fixture = Fixture::new();
        let err = fixture.pipeline(mock().1).run_on_path(fixture.path("missing"), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_overlap_leaving_no_interior_is_a_configuration_error() {
        let mut fixture = Fixture::new();
        fixture.config.inference.tile_size = Some(32);
        let adapter: AdapterHandle = Arc::new(MockUpscaler::new().with_min_overlap(16));
        let err = ComicPipeline::new(&fixture.config, adapter).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));

        fixture.config.inference.tile_size = Some(0);
        let err = ComicPipeline::new(&fixture.config, mock().1).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));
    }

    /// Cancels the run once a given number of batches has completed.
    struct CancelAfter {
        inner: MockUpscaler,
        token: CancellationToken,
        after: usize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl InferenceAdapter for CancelAfter {
        fn name(&self) -> &str {
            "cancel-after"
        }

        async fn infer_batch(&self, tiles: Vec<RgbaImage>, params: &InferenceParameters) -> InferenceResult<Vec<RgbaImage>> {
            let result = self.inner.infer_batch(tiles, params).await;
            if self.completed.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.token.cancel();
            }
            result
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_batch_granularity() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &[Page::new("001.png", png(&picture(4, 4, 1)))]);
        fixture.archive("b.cbz", &book(2));
        fixture.archive("c.cbz", &book(3));
        let token = CancellationToken::new();
        let adapter = Arc::new(CancelAfter {
            inner: MockUpscaler::new(),
            token: token.clone(),
            after: 1,
            completed: AtomicUsize::new(0),
        });

        let summary = fixture.pipeline(adapter.clone()).run_on_path(fixture.library.path(), &token).await.unwrap();
        assert_eq!(names(&summary), ["a.cbz", "b.cbz", "c.cbz"]);
        assert!(matches!(summary.results[0].status, ArchiveStatus::Processed { .. }));
        assert_eq!(summary.cancelled_count(), 2);
        assert_eq!(adapter.completed.load(Ordering::SeqCst), 1);
        assert!(!fixture.path("b (upscaled).cbz").exists());
        assert_eq!(summary.exit_code(), 0);
        assert!(fixture.staging_is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fixture = Fixture::new();
        fixture.archive("a.cbz", &book(1));
        let token = CancellationToken::new();
        token.cancel();
        let (mock, adapter) = mock();
        let summary = fixture.pipeline(adapter).run_on_path(fixture.library.path(), &token).await.unwrap();
        assert_eq!(summary.cancelled_count(), 1);
        assert!(mock.batches().await.is_empty());
        assert!(fixture.staging_is_empty());
    }
}
