//! CLI entry point for the harvester.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::{
    Database, HarvestConfig, HttpClient, HttpPageRenderer, KeywordSearcher, MetadataExtractor,
    OaiHarvester, Pipeline, PipelineSettings, RateLimiter, Registry, ResourceDownloader,
    RunSummary, write_sample_export, write_state_export,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Harvester starting");

    let config = load_config(&args)?;

    if let Some(parent) = config.storage.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let db = Database::new(&config.storage.database_path).await?;
    let registry = Registry::new(db);

    let pipeline = build_pipeline(&config, &registry, args.skip_discovery)?;
    debug!(?pipeline, "pipeline ready");

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_signal.store(true, Ordering::SeqCst);
            warn!("Interrupt received, finishing in-flight items");
        }
    });

    let summary = pipeline.run(&interrupted).await?;
    log_summary(&summary);

    for (status, count) in registry.status_counts().await? {
        info!(%status, count, "Items by status");
    }
    for (kind, status, count) in registry.resource_counts().await? {
        info!(%kind, %status, count, "Resources by kind and status");
    }

    if !args.no_reports {
        let report_dir = &config.storage.report_dir;
        let state = write_state_export(&registry, report_dir).await?;
        let sample = write_sample_export(&registry, report_dir, args.sample_size).await?;
        info!(state = %state.display(), sample = %sample.display(), "Reports written");
    }

    if summary.interrupted || interrupted.load(Ordering::SeqCst) {
        warn!("Run interrupted; run again to resume");
    }

    Ok(())
}

/// Loads the config file (or defaults) and applies CLI overrides.
fn load_config(args: &Args) -> Result<HarvestConfig> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarvestConfig::default(),
    };

    if let Some(db) = &args.db {
        config.storage.database_path.clone_from(db);
    }
    if let Some(dir) = &args.report_dir {
        config.storage.report_dir.clone_from(dir);
    }
    if let Some(concurrency) = args.concurrency {
        config.pipeline.concurrency = usize::from(concurrency);
    }
    if let Some(cap) = args.extraction_cap {
        config.pipeline.extraction_cap = cap;
    }
    if let Some(cap) = args.download_cap {
        config.pipeline.download_cap = cap;
    }

    config.validate()?;
    Ok(config)
}

fn build_pipeline(
    config: &HarvestConfig,
    registry: &Registry,
    skip_discovery: bool,
) -> Result<Pipeline> {
    let client = HttpClient::new(&config.client_settings())?;
    let policy = config.retry_policy();

    let rate_limiter = if config.host_delay().is_zero() {
        debug!("per-host pacing disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(host_delay_ms = config.network.host_delay_ms, "per-host pacing enabled");
        Arc::new(RateLimiter::new(config.host_delay()))
    };

    let max_item_attempts = config.pipeline.max_item_attempts;
    let extractor = MetadataExtractor::new(
        client.clone(),
        registry.clone(),
        Arc::clone(&rate_limiter),
        config.item_page_selectors()?,
        config.storage.snapshot_root.clone(),
        max_item_attempts,
    );
    let downloader = ResourceDownloader::new(
        client.clone(),
        registry.clone(),
        policy.clone(),
        Arc::clone(&rate_limiter),
        config.storage.download_root.clone(),
        max_item_attempts,
    );

    let mut pipeline = Pipeline::new(
        registry.clone(),
        extractor,
        downloader,
        PipelineSettings {
            concurrency: config.pipeline.concurrency,
            extraction_cap: config.pipeline.extraction_cap,
            download_cap: config.pipeline.download_cap,
        },
    )?;

    if skip_discovery {
        info!("Discovery skipped; resuming registry items only");
        return Ok(pipeline);
    }

    for source in &config.oai {
        if !config.is_source_enabled(&source.name) {
            debug!(source = %source.name, "OAI source disabled");
            continue;
        }
        let harvester = OaiHarvester::new(
            source.to_settings(),
            client.clone(),
            Arc::clone(&rate_limiter),
            policy.clone(),
        )?;
        pipeline = pipeline.with_source(Box::new(harvester));
    }

    if let Some(search) = &config.search {
        if config.is_source_enabled(&search.name) {
            let renderer = HttpPageRenderer::new(client, Arc::clone(&rate_limiter), policy);
            let searcher = KeywordSearcher::new(
                search.to_settings(),
                config.search_selectors()?,
                Arc::new(renderer),
            );
            pipeline = pipeline.with_source(Box::new(searcher));
        } else {
            debug!(source = %search.name, "search source disabled");
        }
    }

    Ok(pipeline)
}

fn log_summary(summary: &RunSummary) {
    info!(
        pages = summary.discovery.pages,
        failed_pages = summary.discovery.failed_pages,
        seen = summary.discovery.seen,
        registered = summary.discovery.registered,
        updated = summary.discovery.updated,
        "Discovery complete"
    );
    for source in &summary.failed_sources {
        warn!(source = %source, "Discovery source stopped early");
    }
    info!(
        attempted = summary.extraction.attempted,
        resolved = summary.extraction.advanced,
        no_pdf = summary.extraction.no_pdf,
        failed = summary.extraction.failed,
        "Extraction complete"
    );
    info!(
        attempted = summary.download.attempted,
        downloaded = summary.download.advanced,
        failed = summary.download.failed,
        "Download complete"
    );
}
