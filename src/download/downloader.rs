//! Download stage: fetches each item's binary, verifies it and records it in
//! the resource ledger.
//!
//! Transfers stream into a uniquely named `.part` file next to the final path
//! while the MD5 is computed. The temp file is re-hashed from disk and only renamed into
//! place when both digests agree, so a ledger entry marked `downloaded` always
//! points at a complete file. Interrupted or failed transfers leave no file
//! behind under the final name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::client::{HttpClient, StreamedFile, file_md5, stream_to_file};
use super::error::DownloadError;
use super::filename::{partial_prefix, resource_path};
use super::rate_limiter::RateLimiter;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::registry::{
    Item, ItemStatus, Registry, RegistryError, Resource, ResourceKind, ResourceStatus, Stage,
    StoredFile,
};

/// What the download stage did with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The binary was fetched and verified in this pass.
    Downloaded {
        path: PathBuf,
        md5: String,
        attempts: u32,
    },
    /// A verified copy was already on disk; nothing was fetched.
    AlreadyDownloaded,
    /// The item was moved to an error or terminal status.
    Failed { status: ItemStatus, error: String },
    /// Another worker changed the item first, or it is not downloadable.
    Skipped,
}

/// Fetches binaries for items in `awaiting_download` / `error_download`.
#[derive(Debug, Clone)]
pub struct ResourceDownloader {
    client: HttpClient,
    registry: Registry,
    policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    download_root: PathBuf,
    max_item_attempts: u32,
}

impl ResourceDownloader {
    #[must_use]
    pub fn new(
        client: HttpClient,
        registry: Registry,
        policy: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        download_root: impl Into<PathBuf>,
        max_item_attempts: u32,
    ) -> Self {
        Self {
            client,
            registry,
            policy,
            rate_limiter,
            download_root: download_root.into(),
            max_item_attempts: max_item_attempts.max(1),
        }
    }

    #[must_use]
    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Runs the download stage for one item.
    ///
    /// Transfer failures never escape as errors; they are written to the
    /// ledger and the item's status. Lost status races return
    /// [`DownloadOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] only when the registry itself fails.
    #[instrument(skip(self, item), fields(item_id = item.id, status = %item.status()))]
    pub async fn process_item(&self, item: &Item) -> Result<DownloadOutcome, RegistryError> {
        let status = item.status();
        if status.stage() != Some(Stage::Download) {
            debug!("item not in a download status");
            return Ok(DownloadOutcome::Skipped);
        }

        let Some(pdf_url) = item.pdf_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            let message = "no resolved PDF URL";
            return self.give_up(item, status, message).await;
        };

        let resource = match self
            .registry
            .schedule_resource(item.id, pdf_url, ResourceKind::Pdf)
            .await
        {
            Ok(resource) => resource,
            Err(RegistryError::InvalidIdentity(url)) => {
                let message = format!("unusable PDF URL: {url}");
                return self.give_up(item, status, &message).await;
            }
            Err(e) => return Err(e),
        };

        if resource.is_verified() {
            if stored_file_exists(&resource).await {
                debug!(resource_id = resource.id, "verified copy already on disk");
                return self
                    .finish(item, status, DownloadOutcome::AlreadyDownloaded)
                    .await;
            }
            warn!(
                resource_id = resource.id,
                path = resource.local_path.as_deref().unwrap_or_default(),
                "stored file missing, fetching again"
            );
            self.registry.invalidate_download(resource.id).await?;
        } else if resource.status() == ResourceStatus::FailedPermanent {
            let message = resource
                .last_error
                .clone()
                .unwrap_or_else(|| "resource failed permanently".to_string());
            return self.give_up(item, status, &message).await;
        }

        let target = resource_path(&self.download_root, item.id, &resource.url);
        match self.fetch_with_retry(&resource.url, &target).await {
            Ok((streamed, attempts)) => {
                let stored = StoredFile {
                    local_path: target.display().to_string(),
                    md5: streamed.md5.clone(),
                    size_bytes: streamed.size_bytes,
                };
                self.registry
                    .record_download(resource.id, &stored, attempts)
                    .await?;
                info!(
                    path = %target.display(),
                    bytes = streamed.size_bytes,
                    attempts,
                    "download complete"
                );
                let outcome = DownloadOutcome::Downloaded {
                    path: target,
                    md5: streamed.md5,
                    attempts,
                };
                self.finish(item, status, outcome).await
            }
            Err((error, attempts)) => {
                self.record_transfer_failure(item, status, &resource, &error, attempts)
                    .await
            }
        }
    }

    async fn record_transfer_failure(
        &self,
        item: &Item,
        status: ItemStatus,
        resource: &Resource,
        error: &DownloadError,
        attempts: u32,
    ) -> Result<DownloadOutcome, RegistryError> {
        let resource_status = match classify_error(error) {
            FailureType::Permanent => ResourceStatus::FailedPermanent,
            FailureType::Transient | FailureType::RateLimited => ResourceStatus::FailedTransient,
        };
        let message = error.to_string();
        let recorded = self
            .registry
            .record_resource_failure(resource.id, resource_status, attempts, &message)
            .await?;
        if !recorded {
            // Another worker stored and verified the file meanwhile.
            debug!(url = %resource.url, error = %message, "resource already downloaded, skipping");
            return Ok(DownloadOutcome::Skipped);
        }

        match self
            .registry
            .record_failure(
                item.id,
                status,
                Stage::Download,
                &message,
                self.max_item_attempts,
            )
            .await
        {
            Ok(new_status) => {
                warn!(
                    url = %resource.url,
                    attempts,
                    resource_status = %resource_status,
                    item_status = %new_status,
                    error = %message,
                    "download failed"
                );
                Ok(DownloadOutcome::Failed {
                    status: new_status,
                    error: message,
                })
            }
            Err(e) if e.is_conflict() => Ok(skipped(&e)),
            Err(e) => Err(e),
        }
    }

    /// Moves the item to `failed_permanent` without fetching anything.
    async fn give_up(
        &self,
        item: &Item,
        status: ItemStatus,
        message: &str,
    ) -> Result<DownloadOutcome, RegistryError> {
        match self.registry.fail_permanently(item.id, status, message).await {
            Ok(()) => {
                warn!(error = %message, "item cannot be downloaded");
                Ok(DownloadOutcome::Failed {
                    status: ItemStatus::FailedPermanent,
                    error: message.to_string(),
                })
            }
            Err(e) if e.is_conflict() => Ok(skipped(&e)),
            Err(e) => Err(e),
        }
    }

    /// Advances the item to `processed` once its binary is verified.
    async fn finish(
        &self,
        item: &Item,
        status: ItemStatus,
        outcome: DownloadOutcome,
    ) -> Result<DownloadOutcome, RegistryError> {
        match self
            .registry
            .transition(item.id, status, ItemStatus::Processed)
            .await
        {
            Ok(()) => Ok(outcome),
            Err(e) if e.is_conflict() => Ok(skipped(&e)),
            Err(e) => Err(e),
        }
    }

    /// Fetches `url` into `target` under the retry policy.
    ///
    /// Returns the stored file with the number of attempts made, or the last
    /// error with the attempts spent on it.
    async fn fetch_with_retry(
        &self,
        url: &str,
        target: &Path,
    ) -> Result<(StreamedFile, u32), (DownloadError, u32)> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, url, "attempting download");

            self.rate_limiter.acquire(url).await;

            match self.fetch_once(url, target).await {
                Ok(streamed) => return Ok((streamed, attempt)),
                Err(e) => match self.policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next_attempt,
                    } => {
                        info!(
                            url,
                            attempt = next_attempt,
                            max_attempts = self.policy.max_attempts(),
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "retrying download"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(url, %reason, "not retrying download");
                        return Err((e, attempt));
                    }
                },
            }
        }
    }

    async fn fetch_once(&self, url: &str, target: &Path) -> Result<StreamedFile, DownloadError> {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;

        // Dropping the temp path removes it, so every early return cleans up.
        let partial = tempfile::Builder::new()
            .prefix(&partial_prefix(target))
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| DownloadError::io(parent, e))?
            .into_temp_path();

        let streamed = self.stream_and_verify(url, &partial).await?;
        partial
            .persist(target)
            .map_err(|e| DownloadError::io(target, e.error))?;
        Ok(streamed)
    }

    async fn stream_and_verify(
        &self,
        url: &str,
        partial: &Path,
    ) -> Result<StreamedFile, DownloadError> {
        let response = self.client.get(url, &[]).await?;
        let streamed = stream_to_file(response, url, partial).await?;

        let on_disk = file_md5(partial)
            .await
            .map_err(|e| DownloadError::io(partial, e))?;
        if on_disk != streamed.md5 {
            return Err(DownloadError::integrity(
                partial,
                format!("received {} but stored {on_disk}", streamed.md5),
            ));
        }
        Ok(streamed)
    }
}

fn skipped(error: &RegistryError) -> DownloadOutcome {
    debug!(error = %error, "item changed under us, skipping");
    DownloadOutcome::Skipped
}

async fn stored_file_exists(resource: &Resource) -> bool {
    match resource.local_path.as_deref() {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    }
}
