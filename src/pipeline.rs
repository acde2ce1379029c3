//! Run orchestration: discovery, then extraction, then download.
//!
//! Stages run strictly in order within a run. Inside a stage, items are
//! processed concurrently up to the configured limit; every item's progress
//! is guarded by the registry's status transitions, so two workers (or two
//! overlapping runs) never both advance the same item.
//!
//! Failures stay at item granularity. A failing item is recorded in the
//! registry and counted, and the run carries on. Only a registry that can
//! no longer be queried aborts a run.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::discovery::{DiscoverySource, DiscoveryStats};
use crate::download::{DownloadOutcome, ResourceDownloader};
use crate::extract::{ExtractionOutcome, MetadataExtractor};
use crate::registry::{Item, Registry, RegistryError, Stage};

/// Upper bound on per-stage parallelism.
pub const MAX_CONCURRENCY: usize = 64;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid concurrency value {0}: must be between 1 and {MAX_CONCURRENCY}")]
    InvalidConcurrency(usize),

    /// The registry could not be queried for a stage batch.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Per-run limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub extraction_cap: usize,
    pub download_cap: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            extraction_cap: 500,
            download_cap: 500,
        }
    }
}

/// Counters for one stage, as seen at the end of the stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Items handed to workers.
    pub attempted: usize,
    /// Items moved forward (PDF resolved, or downloaded).
    pub advanced: usize,
    /// Items whose page had no PDF link.
    pub no_pdf: usize,
    /// Items moved to an error or terminal status.
    pub failed: usize,
    /// Items another worker changed first.
    pub skipped: usize,
    /// Items whose registry write failed.
    pub errors: usize,
}

/// Live counters shared by a stage's workers.
#[derive(Debug, Default)]
struct StageStats {
    attempted: AtomicUsize,
    advanced: AtomicUsize,
    no_pdf: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
}

impl StageStats {
    fn record(&self, result: &Result<ItemResult, RegistryError>) {
        let counter = match result {
            Ok(ItemResult::Advanced) => &self.advanced,
            Ok(ItemResult::NoPdf) => &self.no_pdf,
            Ok(ItemResult::Failed) => &self.failed,
            Ok(ItemResult::Skipped) => &self.skipped,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> StageReport {
        StageReport {
            attempted: self.attempted.load(Ordering::SeqCst),
            advanced: self.advanced.load(Ordering::SeqCst),
            no_pdf: self.no_pdf.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

/// Stage-independent view of what happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Advanced,
    NoPdf,
    Failed,
    Skipped,
}

impl From<ExtractionOutcome> for ItemResult {
    fn from(outcome: ExtractionOutcome) -> Self {
        match outcome {
            ExtractionOutcome::PdfResolved { .. } => Self::Advanced,
            ExtractionOutcome::NoPdfFound => Self::NoPdf,
            ExtractionOutcome::Failed { .. } => Self::Failed,
            ExtractionOutcome::Skipped => Self::Skipped,
        }
    }
}

impl From<DownloadOutcome> for ItemResult {
    fn from(outcome: DownloadOutcome) -> Self {
        match outcome {
            DownloadOutcome::Downloaded { .. } | DownloadOutcome::AlreadyDownloaded => {
                Self::Advanced
            }
            DownloadOutcome::Failed { .. } => Self::Failed,
            DownloadOutcome::Skipped => Self::Skipped,
        }
    }
}

/// Everything one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovery: DiscoveryStats,
    /// Discovery sources that stopped on a registry failure.
    pub failed_sources: Vec<String>,
    pub extraction: StageReport,
    pub download: StageReport,
    /// Whether the run stopped early on cancellation.
    pub interrupted: bool,
}

/// Drives items through discovery, extraction and download.
pub struct Pipeline {
    registry: Registry,
    sources: Vec<Box<dyn DiscoverySource>>,
    extractor: MetadataExtractor,
    downloader: ResourceDownloader,
    settings: PipelineSettings,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline with no discovery sources.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConcurrency`] if `settings.concurrency`
    /// is outside `1..=MAX_CONCURRENCY`.
    pub fn new(
        registry: Registry,
        extractor: MetadataExtractor,
        downloader: ResourceDownloader,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        if !(1..=MAX_CONCURRENCY).contains(&settings.concurrency) {
            return Err(PipelineError::InvalidConcurrency(settings.concurrency));
        }
        Ok(Self {
            registry,
            sources: Vec::new(),
            extractor,
            downloader,
            settings,
            semaphore: Arc::new(Semaphore::new(settings.concurrency)),
        })
    }

    /// Appends a discovery source; sources run in insertion order.
    #[must_use]
    pub fn with_source(mut self, source: Box<dyn DiscoverySource>) -> Self {
        self.sources.push(source);
        self
    }

    #[must_use]
    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Runs every stage once, stopping between items when `interrupted` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Registry`] when a stage batch cannot be
    /// queried. Item-level failures are counted in the summary instead.
    #[instrument(skip(self, interrupted), fields(sources = self.sources.len()))]
    pub async fn run(&self, interrupted: &Arc<AtomicBool>) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        for source in &self.sources {
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            info!(source = source.name(), "running discovery source");
            match source.discover(&self.registry, interrupted).await {
                Ok(stats) => {
                    info!(
                        source = source.name(),
                        pages = stats.pages,
                        failed_pages = stats.failed_pages,
                        registered = stats.registered,
                        updated = stats.updated,
                        skipped = stats.skipped,
                        "discovery source finished"
                    );
                    summary.discovery.absorb(&stats);
                }
                Err(e) => {
                    error!(source = source.name(), error = %e, "discovery source failed");
                    summary.failed_sources.push(source.name().to_string());
                }
            }
        }

        if !interrupted.load(Ordering::SeqCst) {
            let extractor = self.extractor.clone();
            summary.extraction = self
                .run_stage(
                    Stage::Extraction,
                    self.settings.extraction_cap,
                    interrupted,
                    move |item| {
                        let extractor = extractor.clone();
                        async move { extractor.process_item(&item).await.map(ItemResult::from) }
                    },
                )
                .await?;
        }

        if !interrupted.load(Ordering::SeqCst) {
            let downloader = self.downloader.clone();
            summary.download = self
                .run_stage(
                    Stage::Download,
                    self.settings.download_cap,
                    interrupted,
                    move |item| {
                        let downloader = downloader.clone();
                        async move { downloader.process_item(&item).await.map(ItemResult::from) }
                    },
                )
                .await?;
        }

        summary.interrupted = interrupted.load(Ordering::SeqCst);
        Ok(summary)
    }

    /// Processes one batch of actionable items for `stage`.
    ///
    /// In-flight items always run to completion; cancellation only stops
    /// new items from being started.
    async fn run_stage<F, Fut>(
        &self,
        stage: Stage,
        cap: usize,
        interrupted: &Arc<AtomicBool>,
        work: F,
    ) -> Result<StageReport, PipelineError>
    where
        F: Fn(Item) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ItemResult, RegistryError>> + Send + 'static,
    {
        let items = self
            .registry
            .query(stage.actionable_statuses(), cap)
            .await?;
        info!(%stage, batch = items.len(), cap, "starting stage");

        let stats = Arc::new(StageStats::default());
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            if interrupted.load(Ordering::SeqCst) {
                info!(%stage, "stop requested, not starting further items");
                break;
            }

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::SemaphoreClosed)?;

            // Re-check after waiting for a slot.
            if interrupted.load(Ordering::SeqCst) {
                break;
            }

            stats.attempted.fetch_add(1, Ordering::SeqCst);
            let item_id = item.id;
            let url = item.url.clone();
            let task = work(item);
            let stats = Arc::clone(&stats);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = task.await;
                match &result {
                    Ok(outcome) => debug!(item_id, %url, %stage, ?outcome, "item done"),
                    Err(e) => warn!(item_id, %url, %stage, error = %e, "registry write failed"),
                }
                stats.record(&result);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(%stage, error = %e, "stage task panicked");
            }
        }

        let report = stats.snapshot();
        info!(
            %stage,
            attempted = report.attempted,
            advanced = report.advanced,
            no_pdf = report.no_pdf,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "stage complete"
        );
        Ok(report)
    }
}
