//! HTTP fetching, retry policy, per-host pacing and the download stage.
//!
//! Everything that touches the network goes through [`HttpClient`] and a
//! shared [`RateLimiter`]. The download stage itself lives in
//! [`ResourceDownloader`], which streams binaries to disk, verifies them by
//! MD5 and writes the outcome to the resource ledger.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvester_core::download::{ClientSettings, HttpClient, RateLimiter, ResourceDownloader, RetryPolicy};
//! use harvester_core::{Database, Registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new(Database::new_in_memory().await?);
//! let downloader = ResourceDownloader::new(
//!     HttpClient::new(&ClientSettings::default())?,
//!     registry.clone(),
//!     RetryPolicy::default(),
//!     Arc::new(RateLimiter::disabled()),
//!     "./data/pdfs",
//!     3,
//! );
//! # Ok(())
//! # }
//! ```

mod client;
pub(crate) mod constants;
mod downloader;
mod error;
pub mod filename;
pub mod rate_limiter;
mod retry;

pub use client::{ClientSettings, HttpClient, StreamedFile, bytes_md5, default_user_agent, file_md5};
pub use downloader::{DownloadOutcome, ResourceDownloader};
pub use error::DownloadError;
pub use filename::{resource_file_name, resource_path, snapshot_path};
pub use rate_limiter::{RateLimiter, extract_host};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};

// Note: no module-local Result alias; use `Result<T, DownloadError>` explicitly.
