//! Drives archives through staging, tiling, batched inference and repacking.
//!
//! A producer stages and plans archives in discovery order and hands them to
//! the consumer through a bounded queue, so the next archives are prepared
//! while the current one is being upscaled. The consumer is the only caller
//! of the inference adapter. It pools tiles from every archive it has
//! received into batches, routes each result back to its page through the
//! tile's [`TileRef`], and finalises an archive as soon as all of its tiles
//! are settled.

use crate::Settings;
use crate::codec::{self, PageEncoding};
use crate::discover::{is_upscaled, output_paths};
use crate::error::{ErrorKind, FailureKind, Result};
use crate::state::{ArchiveState, Lifecycle};
use crate::summary::{ArchiveResult, ArchiveStatus, Failure, PageFailure, SkipReason, Summary};
use comicup_archive::error::Result as WriteResult;
use comicup_archive::{ArchiveFormat, Page};
use comicup_inference::error::{ErrorKind as InferenceErrorKind, Result as InferenceResult};
use comicup_inference::{AdapterHandle, InferenceParameters};
use comicup_staging::error::{ErrorKind as StagingErrorKind, Result as StagingResult};
use comicup_staging::{Outcome, StagingArea, StagingHandle};
use comicup_tiling::error::ErrorKind as TilingErrorKind;
use comicup_tiling::{Dimensions, Tile};
use image::RgbaImage;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Back-reference from a tile to its owner: the archive's discovery index,
/// the page's position among the archive's image pages, and the tile's
/// position in the page's plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TileRef {
    archive: usize,
    page: usize,
    tile: usize,
}
impl TileRef {
    fn page_key(&self) -> (usize, usize) {
        (self.archive, self.page)
    }
}

struct TileJob {
    owner: TileRef,
    image: RgbaImage,
    /// Dimensions the upscaled tile must have.
    expected: Dimensions,
}

struct PageWork {
    entry: PathBuf,
    encoding: PageEncoding,
    dimensions: Dimensions,
    tiles: Vec<Tile>,
    results: Vec<Option<RgbaImage>>,
    failed: bool,
}

/// An archive that has been staged and planned and is waiting for its tiles.
struct InFlight {
    lifecycle: Lifecycle,
    output: PathBuf,
    handle: StagingHandle,
    pages: Vec<PageWork>,
    image_pages: usize,
    /// Tiles not yet settled, successfully or not.
    remaining: usize,
    failures: Vec<PageFailure>,
}

enum Prepared {
    Ready(Box<InFlight>, Vec<TileJob>),
    Finished(ArchiveStatus),
}

struct Arrival {
    index: usize,
    archive: PathBuf,
    prepared: Prepared,
}

#[derive(Default)]
struct Plan {
    pages: Vec<PageWork>,
    jobs: Vec<TileJob>,
    failures: Vec<PageFailure>,
    image_pages: usize,
}

pub struct BatchScheduler {
    adapter: AdapterHandle,
    params: InferenceParameters,
    settings: Settings,
    staging: StagingArea,
    scale: u32,
    overlap: u32,
}

impl BatchScheduler {
    /// The scale factor and minimum overlap are taken from the adapter once,
    /// here. A tile size the raised overlap leaves no room in is a
    /// configuration error.
    pub fn new(
        adapter: AdapterHandle,
        params: InferenceParameters,
        settings: Settings,
        staging: StagingArea,
    ) -> Result<Self> {
        let scale = adapter.scale_factor(&params);
        if scale == 0 {
            exn::bail!(ErrorKind::Configuration(format!("{} reports a scale factor of 0", adapter.name())));
        }
        let overlap = settings.overlap.max(adapter.min_overlap(&params));
        if let Some(tile_size) = params.tile_size
            && u64::from(tile_size.get()) <= 2 * u64::from(overlap)
        {
            exn::bail!(ErrorKind::Configuration(format!(
                "tile size {tile_size} must be larger than twice the overlap of {overlap} required by {}",
                adapter.name()
            )));
        }
        tracing::debug!(adapter = adapter.name(), scale, overlap, "Batch scheduler ready");
        Ok(Self { adapter, params, settings, staging, scale, overlap })
    }

    /// Process a single archive through its whole lifecycle.
    pub async fn process(&self, archive: impl Into<PathBuf>, cancel: &CancellationToken) -> ArchiveResult {
        let archive = archive.into();
        let summary = self.run(vec![archive.clone()], cancel).await;
        summary
            .results
            .into_iter()
            .next()
            .unwrap_or(ArchiveResult { archive, status: ArchiveStatus::Cancelled })
    }

    /// Process `archives` in order. Results are reported in the same order,
    /// however their tiles were batched.
    ///
    /// Once `cancel` fires, batches already dispatched complete, no further
    /// batch is dispatched, and every archive not yet finished is reported
    /// as cancelled with its staging area released.
    pub async fn run(&self, archives: Vec<PathBuf>, cancel: &CancellationToken) -> Summary {
        let total = archives.len();
        let outputs = output_paths(&archives, &self.settings.output_suffix, self.settings.output_format).await;
        let (tx, mut rx) = mpsc::channel(self.settings.queue_depth.max(1));
        let producer = async move {
            for (index, (archive, output)) in archives.into_iter().zip(outputs).enumerate() {
                let prepared = if cancel.is_cancelled() {
                    Prepared::Finished(ArchiveStatus::Cancelled)
                } else {
                    self.prepare(index, &archive, output).await
                };
                if tx.send(Arrival { index, archive, prepared }).await.is_err() {
                    break;
                }
            }
        };
        let ((), results) = futures::join!(producer, self.consume(&mut rx, cancel));
        tracing::debug!(archives = total, reported = results.len(), "Run finished");
        Summary { results: results.into_values().collect() }
    }

    // Producer side

    #[instrument(skip_all, fields(archive = %archive.display()))]
    async fn prepare(&self, index: usize, archive: &Path, output: PathBuf) -> Prepared {
        let mut lifecycle = Lifecycle::new(archive);
        if let Some(reason) = self.skip_reason(archive, &output).await {
            return Prepared::Finished(ArchiveStatus::Skipped(reason));
        }

        let (handle, pages) = match self.stage(archive).await {
            Ok(staged) => staged,
            Err(err) => {
                lifecycle.advance(ArchiveState::Failed);
                tracing::debug!(error = ?err, "Staging failed");
                return Prepared::Finished(ArchiveStatus::Failed(Failure::new(FailureKind::of_staging(&err), &*err)));
            },
        };
        lifecycle.advance(ArchiveState::Staged);

        let (tile_size, overlap, scale) = (self.params.tile_size, self.overlap, self.scale);
        let plan = match tokio::task::spawn_blocking(move || plan_pages(index, pages, tile_size, overlap, scale)).await {
            Ok(plan) => plan,
            Err(err) => {
                lifecycle.advance(ArchiveState::Failed);
                handle.release(Outcome::Failed).await;
                return Prepared::Finished(ArchiveStatus::Failed(Failure::new(FailureKind::Io, err)));
            },
        };
        lifecycle.advance(ArchiveState::Planned);
        tracing::debug!(pages = plan.image_pages, tiles = plan.jobs.len(), reused = handle.was_reused(), "Archive planned");

        // Pages that cannot even be decoded fail the archive: skip inference.
        let jobs = if plan.failures.is_empty() { plan.jobs } else { Vec::new() };
        let flight = InFlight {
            lifecycle,
            output,
            handle,
            pages: plan.pages,
            image_pages: plan.image_pages,
            remaining: jobs.len(),
            failures: plan.failures,
        };
        Prepared::Ready(Box::new(flight), jobs)
    }

    async fn skip_reason(&self, archive: &Path, output: &Path) -> Option<SkipReason> {
        if is_upscaled(archive, &self.settings.output_suffix) {
            return Some(SkipReason::AlreadyUpscaled);
        }
        let candidate = output.to_path_buf();
        let complete = tokio::task::spawn_blocking(move || ArchiveFormat::is_complete(candidate)).await.unwrap_or(false);
        complete.then(|| SkipReason::OutputExists(output.to_path_buf()))
    }

    /// Acquire the staging area and read every entry. A staging area that
    /// loses files between acquisition and reading is staged once more from
    /// scratch.
    async fn stage(&self, archive: &Path) -> StagingResult<(StagingHandle, Vec<Page>)> {
        let mut restaged = false;
        loop {
            let handle = self.staging.acquire(archive).await?;
            match handle.pages().await {
                Ok(pages) => return Ok((handle, pages)),
                Err(err) if matches!(&*err, StagingErrorKind::Incomplete(_)) && !restaged => {
                    tracing::warn!(error = ?err, "Staging area lost entries; staging again");
                    handle.release(Outcome::Failed).await;
                    restaged = true;
                },
                Err(err) => {
                    handle.release(Outcome::Failed).await;
                    return Err(err);
                },
            }
        }
    }

    // Consumer side

    async fn consume(&self, rx: &mut mpsc::Receiver<Arrival>, cancel: &CancellationToken) -> BTreeMap<usize, ArchiveResult> {
        let mut results = BTreeMap::new();
        let mut inflight = BTreeMap::new();
        let mut pending = VecDeque::new();
        let mut open = true;
        let mut batch_id = 0u64;
        while !cancel.is_cancelled() {
            if open && !self.batch_ready(&pending) {
                match rx.recv().await {
                    Some(arrival) => self.admit(arrival, &mut inflight, &mut pending, &mut results).await,
                    None => open = false,
                }
                continue;
            }
            if pending.is_empty() {
                break;
            }
            batch_id += 1;
            let batch = self.next_batch(&mut pending);
            self.dispatch(batch_id, batch, &mut inflight, &mut pending).await;
            self.finalize_ready(&mut inflight, &mut results).await;
        }

        // Only reachable with work left over after a cancellation.
        for (index, flight) in std::mem::take(&mut inflight) {
            let archive = flight.lifecycle.archive().to_path_buf();
            flight.handle.release(Outcome::Cancelled).await;
            record(&mut results, index, ArchiveResult { archive, status: ArchiveStatus::Cancelled });
        }
        while let Some(arrival) = rx.recv().await {
            let status = match arrival.prepared {
                Prepared::Ready(flight, _) => {
                    let InFlight { handle, .. } = *flight;
                    handle.release(Outcome::Cancelled).await;
                    ArchiveStatus::Cancelled
                },
                Prepared::Finished(status) => status,
            };
            record(&mut results, arrival.index, ArchiveResult { archive: arrival.archive, status });
        }
        results
    }

    async fn admit(
        &self,
        arrival: Arrival,
        inflight: &mut BTreeMap<usize, InFlight>,
        pending: &mut VecDeque<TileJob>,
        results: &mut BTreeMap<usize, ArchiveResult>,
    ) {
        match arrival.prepared {
            Prepared::Finished(status) => {
                record(results, arrival.index, ArchiveResult { archive: arrival.archive, status });
            },
            Prepared::Ready(mut flight, jobs) => {
                flight.lifecycle.advance(ArchiveState::Inferring);
                pending.extend(jobs);
                inflight.insert(arrival.index, *flight);
                // Archives without anything to upscale are finished already.
                self.finalize_ready(inflight, results).await;
            },
        }
    }

    fn batch_ready(&self, pending: &VecDeque<TileJob>) -> bool {
        match self.params.batch_size {
            Some(size) => pending.len() >= size.get(),
            None => !pending.is_empty(),
        }
    }

    /// Take the next batch off the queue: up to `batch_size` tiles from any
    /// archive, or without a batch size, every tile of the next page.
    fn next_batch(&self, pending: &mut VecDeque<TileJob>) -> Vec<TileJob> {
        let take = match self.params.batch_size {
            Some(size) => size.get().min(pending.len()),
            None => {
                let first = pending.front().map(|job| job.owner.page_key());
                pending.iter().take_while(|job| Some(job.owner.page_key()) == first).count()
            },
        };
        pending.drain(..take).collect()
    }

    /// Dispatch one batch. When it fails for good, its tiles are dispatched
    /// again page by page so only the pages that really fail are lost.
    #[instrument(skip_all, fields(batch = id, tiles = jobs.len()))]
    async fn dispatch(
        &self,
        id: u64,
        jobs: Vec<TileJob>,
        inflight: &mut BTreeMap<usize, InFlight>,
        pending: &mut VecDeque<TileJob>,
    ) {
        let mut settled = Vec::new();
        match self.infer(&jobs).await {
            Ok(outputs) => settled.push((jobs, Ok(outputs))),
            Err(err) if split_by_page(&jobs).len() <= 1 => settled.push((jobs, Err(err))),
            Err(err) => {
                tracing::warn!(error = ?err, "Batch failed; dispatching each page separately");
                for group in into_page_groups(jobs) {
                    let outcome = self.infer(&group).await;
                    settled.push((group, outcome));
                }
            },
        }

        let mut failed = BTreeSet::new();
        for (jobs, outcome) in settled {
            route(jobs, outcome, inflight, &mut failed);
        }
        // A failed archive is not written; skip the rest of its tiles.
        if !failed.is_empty() {
            pending.retain(|job| {
                let skip = failed.contains(&job.owner.archive);
                if skip && let Some(flight) = inflight.get_mut(&job.owner.archive) {
                    flight.remaining = flight.remaining.saturating_sub(1);
                }
                !skip
            });
        }
    }

    /// Run one batch through the adapter, retrying retryable failures up to
    /// `max_retries` times. Output of the wrong count or dimensions fails the
    /// whole batch.
    async fn infer(&self, jobs: &[TileJob]) -> InferenceResult<Vec<RgbaImage>> {
        let mut attempt = 0;
        loop {
            let tiles = jobs.iter().map(|job| job.image.clone()).collect();
            let result = self.adapter.infer_batch(tiles, &self.params).await.and_then(|outputs| check_outputs(jobs, outputs));
            match result {
                Ok(outputs) => return Ok(outputs),
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, max_retries = self.settings.max_retries, error = ?err, "Inference failed; retrying batch");
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn finalize_ready(&self, inflight: &mut BTreeMap<usize, InFlight>, results: &mut BTreeMap<usize, ArchiveResult>) {
        let ready = inflight.iter().filter(|(_, flight)| flight.remaining == 0).map(|(index, _)| *index).collect::<Vec<_>>();
        for index in ready {
            if let Some(flight) = inflight.remove(&index) {
                let archive = flight.lifecycle.archive().to_path_buf();
                let status = self.finalize(flight).await;
                record(results, index, ArchiveResult { archive, status });
            }
        }
    }

    #[instrument(skip_all, fields(archive = %flight.lifecycle.archive().display()))]
    async fn finalize(&self, flight: InFlight) -> ArchiveStatus {
        let InFlight { mut lifecycle, output, handle, pages, image_pages, failures, .. } = flight;
        if !failures.is_empty() {
            lifecycle.advance(ArchiveState::Failed);
            handle.release(Outcome::Failed).await;
            return ArchiveStatus::Failed(Failure::from_pages(failures, image_pages));
        }
        match self.repack(&handle, pages, &output, &mut lifecycle).await {
            Ok(upscaled) => {
                lifecycle.advance(ArchiveState::Done);
                handle.release(Outcome::Completed).await;
                ArchiveStatus::Processed { output, pages: upscaled }
            },
            Err(failure) => {
                lifecycle.advance(ArchiveState::Failed);
                handle.release(Outcome::Failed).await;
                ArchiveStatus::Failed(failure)
            },
        }
    }

    /// Reassemble and re-encode every page into the staging area, then pack
    /// the staged entries, in archive order, into the output archive.
    async fn repack(
        &self,
        handle: &StagingHandle,
        pages: Vec<PageWork>,
        output: &Path,
        lifecycle: &mut Lifecycle,
    ) -> std::result::Result<usize, Failure> {
        let count = pages.len();
        for page in pages {
            let PageWork { entry, encoding, dimensions, tiles, results, .. } = page;
            let (scale, quality, name) = (self.scale, self.settings.jpeg_quality, entry.clone());
            let encoded = tokio::task::spawn_blocking(move || {
                let fail = |kind, reason: String| PageFailure { page: name.clone(), kind, reason };
                let upscaled = tiles.into_iter().zip(results).filter_map(|(tile, result)| result.map(|image| (tile, image)));
                let image = comicup_tiling::recompose(dimensions, scale, upscaled)
                    .map_err(|e| fail(FailureKind::Tiling, e.to_string()))?;
                codec::encode(image, encoding, quality).map_err(|e| fail(FailureKind::Image, e.to_string()))
            })
            .await
            .map_err(|e| Failure::new(FailureKind::Io, e))?
            .map_err(|page| Failure::from_pages(vec![page], count))?;
            handle
                .replace(&entry, &encoded)
                .await
                .map_err(|e| Failure::new(FailureKind::of_staging(&e), &*e))?;
        }
        lifecycle.advance(ArchiveState::Recomposed);

        let staged = handle.pages().await.map_err(|e| Failure::new(FailureKind::of_staging(&e), &*e))?;
        let (format, compression, destination) =
            (self.settings.output_format, self.settings.entry_compression, output.to_path_buf());
        tokio::task::spawn_blocking(move || {
            write_retrying_once(&destination, || format.write(&destination, &staged, compression))
        })
        .await
        .map_err(|e| Failure::new(FailureKind::Io, e))??;
        lifecycle.advance(ArchiveState::Repacked);
        Ok(count)
    }
}

/// Run `write`, once more if the first attempt fails with a retryable error.
fn write_retrying_once(
    output: &Path,
    mut write: impl FnMut() -> WriteResult<()>,
) -> std::result::Result<(), Failure> {
    let mut retried = false;
    loop {
        match write() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && !retried => {
                tracing::warn!(output = %output.display(), error = ?err, "Writing output failed; retrying once");
                retried = true;
            },
            Err(err) => return Err(Failure::new(FailureKind::of_archive(&err), &*err)),
        }
    }
}

fn record(results: &mut BTreeMap<usize, ArchiveResult>, index: usize, result: ArchiveResult) {
    let archive = result.archive.display();
    match &result.status {
        ArchiveStatus::Processed { output, pages } => {
            tracing::info!(%archive, output = %output.display(), pages, "Archive upscaled");
        },
        ArchiveStatus::Skipped(reason) => tracing::info!(%archive, %reason, "Skipping archive"),
        ArchiveStatus::Failed(failure) => {
            tracing::warn!(%archive, kind = %failure.kind, reason = %failure.reason, "Archive failed");
            for page in &failure.pages {
                tracing::warn!(%archive, page = %page.page.display(), kind = %page.kind, reason = %page.reason, "Page failed");
            }
        },
        ArchiveStatus::Cancelled => tracing::info!(%archive, "Archive cancelled"),
    }
    results.insert(index, result);
}

/// Record a settled group of tiles against their pages. Archives that gain
/// a failed page are added to `failed`.
fn route(
    jobs: Vec<TileJob>,
    outcome: InferenceResult<Vec<RgbaImage>>,
    inflight: &mut BTreeMap<usize, InFlight>,
    failed: &mut BTreeSet<usize>,
) {
    match outcome {
        Ok(outputs) => {
            for (job, output) in jobs.into_iter().zip(outputs) {
                let Some(flight) = inflight.get_mut(&job.owner.archive) else { continue };
                flight.remaining = flight.remaining.saturating_sub(1);
                if let Some(page) = flight.pages.get_mut(job.owner.page)
                    && let Some(slot) = page.results.get_mut(job.owner.tile)
                {
                    *slot = Some(output);
                }
            }
        },
        Err(err) => {
            let reason = err.to_string();
            for job in jobs {
                let Some(flight) = inflight.get_mut(&job.owner.archive) else { continue };
                flight.remaining = flight.remaining.saturating_sub(1);
                if let Some(page) = flight.pages.get_mut(job.owner.page)
                    && !page.failed
                {
                    page.failed = true;
                    flight.failures.push(PageFailure {
                        page: page.entry.clone(),
                        kind: FailureKind::Inference,
                        reason: reason.clone(),
                    });
                    failed.insert(job.owner.archive);
                }
            }
        },
    }
}

fn check_outputs(jobs: &[TileJob], outputs: Vec<RgbaImage>) -> InferenceResult<Vec<RgbaImage>> {
    if outputs.len() != jobs.len() {
        exn::bail!(InferenceErrorKind::MalformedOutput(format!("{} outputs for {} tiles", outputs.len(), jobs.len())));
    }
    for (position, (job, output)) in jobs.iter().zip(&outputs).enumerate() {
        let actual = Dimensions::of(output);
        if actual != job.expected {
            exn::bail!(InferenceErrorKind::MalformedOutput(format!(
                "tile {position} is {actual}, expected {}",
                job.expected
            )));
        }
    }
    Ok(outputs)
}

/// Distinct pages in a batch, in order of first appearance.
fn split_by_page(jobs: &[TileJob]) -> Vec<(usize, usize)> {
    let mut pages = Vec::new();
    for job in jobs {
        let key = job.owner.page_key();
        if !pages.contains(&key) {
            pages.push(key);
        }
    }
    pages
}

fn into_page_groups(jobs: Vec<TileJob>) -> Vec<Vec<TileJob>> {
    let order = split_by_page(&jobs);
    let mut groups = order.iter().map(|_| Vec::new()).collect::<Vec<_>>();
    for job in jobs {
        if let Some(position) = order.iter().position(|key| *key == job.owner.page_key()) {
            groups[position].push(job);
        }
    }
    groups
}

/// Decode and tile every image entry. Entries that are not images are left
/// alone; they are packed into the output as staged.
fn plan_pages(archive: usize, pages: Vec<Page>, tile_size: Option<NonZeroU32>, overlap: u32, scale: u32) -> Plan {
    let mut plan = Plan::default();
    for page in pages {
        if !codec::is_image_entry(&page.path) {
            continue;
        }
        plan.image_pages += 1;
        match plan_page(archive, plan.pages.len(), &page, tile_size, overlap, scale) {
            Ok((work, jobs)) => {
                plan.pages.push(work);
                plan.jobs.extend(jobs);
            },
            Err(failure) => plan.failures.push(failure),
        }
    }
    plan
}

fn plan_page(
    archive: usize,
    position: usize,
    page: &Page,
    tile_size: Option<NonZeroU32>,
    overlap: u32,
    scale: u32,
) -> std::result::Result<(PageWork, Vec<TileJob>), PageFailure> {
    let fail = |kind, reason: String| PageFailure { page: page.path.clone(), kind, reason };
    let (image, encoding) = codec::decode(&page.path, &page.data).map_err(|e| fail(FailureKind::Image, e.to_string()))?;
    let dimensions = Dimensions::of(&image);
    let tiles = comicup_tiling::plan(dimensions, tile_size, overlap).map_err(|e| fail(FailureKind::Tiling, e.to_string()))?;
    let mut jobs = Vec::with_capacity(tiles.len());
    for (index, tile) in tiles.iter().enumerate() {
        let expected = tile
            .region
            .dimensions()
            .scaled(scale)
            .ok_or_else(|| fail(FailureKind::Tiling, TilingErrorKind::InvalidScale(scale).to_string()))?;
        jobs.push(TileJob { owner: TileRef { archive, page: position, tile: index }, image: tile.extract(&image), expected });
    }
    let results = vec![None; tiles.len()];
    let work = PageWork { entry: page.path.clone(), encoding, dimensions, tiles, results, failed: false };
    Ok((work, jobs))
}
