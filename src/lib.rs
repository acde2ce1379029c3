//! Harvester Core Library
//!
//! Resumable harvesting of bibliographic metadata and PDFs from agricultural
//! repositories. Every discovered item lives in a persistent registry and
//! moves through a status lifecycle, so a run can be interrupted at any point
//! and the next run picks up where it stopped.
//!
//! # Architecture
//!
//! - [`db`] - SQLite connection and migrations
//! - [`registry`] - Item registry and resource ledger (single source of truth)
//! - [`discovery`] - OAI-PMH and keyword-search discovery sources
//! - [`extract`] - Selector-chain metadata and PDF link extraction
//! - [`download`] - HTTP client, retry policy, pacing and the download stage
//! - [`pipeline`] - Stage orchestration under per-run limits
//! - [`config`] - TOML configuration
//! - [`report`] - JSON exports over the registry

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod discovery;
pub mod download;
pub mod extract;
pub mod pipeline;
pub mod registry;
pub mod report;

// Re-export commonly used types
pub use config::{ConfigError, HarvestConfig};
pub use db::{Database, DbError};
pub use discovery::{
    DiscoveryError, DiscoverySource, DiscoveryStats, HttpPageRenderer, KeywordSearcher,
    OaiHarvester,
};
pub use download::{
    DownloadError, DownloadOutcome, FailureType, HttpClient, RateLimiter, ResourceDownloader,
    RetryDecision, RetryPolicy, classify_error,
};
pub use extract::{ExtractionOutcome, MetadataExtractor, SelectorChain, SelectorRule};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, RunSummary, StageReport};
pub use registry::{
    Item, ItemMetadata, ItemStatus, Registry, RegistryError, Resource, ResourceKind,
    ResourceStatus, Stage,
};
pub use report::{ReportError, write_sample_export, write_state_export};
