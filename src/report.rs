//! JSON exports over the registry.
//!
//! Two read-only views are written after a run:
//!
//! - `harvest_state.json`: every item with its metadata and resource list.
//! - `sample_results.json`: a sample of downloaded PDFs with hash, size and
//!   the metadata needed to spot-check them by hand.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::registry::{
    Item, ItemMetadata, ItemStatus, Registry, RegistryError, Resource, ResourceKind,
    ResourceStatus,
};

pub const STATE_EXPORT_FILE: &str = "harvest_state.json";
pub const SAMPLE_EXPORT_FILE: &str = "sample_results.json";

/// Errors produced while writing exports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error writing report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Serialize)]
struct StateExport {
    generated_at: DateTime<Utc>,
    item_count: usize,
    items: Vec<ItemEntry>,
}

#[derive(Debug, Serialize)]
struct ItemEntry {
    id: i64,
    url: String,
    source: String,
    status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    error_count: i64,
    metadata: ItemMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_path: Option<String>,
    resources: Vec<ResourceEntry>,
}

#[derive(Debug, Serialize)]
struct ResourceEntry {
    url: String,
    kind: &'static str,
    status: &'static str,
    downloaded: bool,
    local_path: Option<String>,
    md5: Option<String>,
    size_bytes: Option<i64>,
    attempt_count: i64,
}

impl From<&Resource> for ResourceEntry {
    fn from(resource: &Resource) -> Self {
        Self {
            url: resource.url.clone(),
            kind: resource.kind().as_str(),
            status: resource.status().as_str(),
            downloaded: resource.status() == ResourceStatus::Downloaded,
            local_path: resource.local_path.clone(),
            md5: resource.md5.clone(),
            size_bytes: resource.size_bytes,
            attempt_count: resource.attempt_count,
        }
    }
}

#[derive(Debug, Serialize)]
struct SampleExport {
    generated_at: DateTime<Utc>,
    sample_size: usize,
    samples: Vec<SampleEntry>,
}

#[derive(Debug, Serialize)]
struct SampleEntry {
    item_url: String,
    pdf_url: String,
    local_path: Option<String>,
    md5: Option<String>,
    size_bytes: Option<i64>,
    title: Option<String>,
    authors: Vec<String>,
    publication_date: Option<String>,
    doi: Option<String>,
}

fn write_json<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<PathBuf, ReportError> {
    let path = dir.join(file_name);
    let io_err = |source| ReportError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    let file = fs::File::create(&path).map_err(io_err)?;
    let write_result = serde_json::to_writer_pretty(BufWriter::new(file), value);
    if let Err(err) = write_result {
        let _ = fs::remove_file(&path);
        return Err(err.into());
    }
    Ok(path)
}

/// Writes the full-state export into `dir` and returns its path.
///
/// # Errors
///
/// Returns [`ReportError`] on registry, I/O or serialization failure.
#[instrument(skip(registry), fields(dir = %dir.display()))]
pub async fn write_state_export(registry: &Registry, dir: &Path) -> Result<PathBuf, ReportError> {
    let items = registry.all_items().await?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let resources = registry.resources_for_item(item.id).await?;
        entries.push(item_entry(item, &resources));
    }

    let export = StateExport {
        generated_at: Utc::now(),
        item_count: entries.len(),
        items: entries,
    };
    let path = write_json(dir, STATE_EXPORT_FILE, &export)?;
    info!(path = %path.display(), items = export.item_count, "state export written");
    Ok(path)
}

fn item_entry(item: Item, resources: &[Resource]) -> ItemEntry {
    let status = item.status();
    let mut metadata = item.metadata();
    let snapshot_path = metadata.snapshot_path.take();
    ItemEntry {
        id: item.id,
        url: item.url,
        source: item.source,
        status,
        last_error: item.last_error,
        error_count: item.error_count,
        metadata,
        snapshot_path,
        resources: resources.iter().map(ResourceEntry::from).collect(),
    }
}

/// Writes up to `sample_size` downloaded PDFs into `dir` and returns its path.
///
/// # Errors
///
/// Returns [`ReportError`] on registry, I/O or serialization failure.
#[instrument(skip(registry), fields(dir = %dir.display()))]
pub async fn write_sample_export(
    registry: &Registry,
    dir: &Path,
    sample_size: usize,
) -> Result<PathBuf, ReportError> {
    let samples: Vec<SampleEntry> = registry
        .downloaded_resources(ResourceKind::Pdf, sample_size)
        .await?
        .into_iter()
        .map(|(item, resource)| {
            let metadata = item.metadata();
            SampleEntry {
                item_url: item.url,
                pdf_url: resource.url,
                local_path: resource.local_path,
                md5: resource.md5,
                size_bytes: resource.size_bytes,
                title: metadata.title,
                authors: metadata.authors,
                publication_date: metadata.publication_date,
                doi: metadata.doi,
            }
        })
        .collect();

    let export = SampleExport {
        generated_at: Utc::now(),
        sample_size: samples.len(),
        samples,
    };
    let path = write_json(dir, SAMPLE_EXPORT_FILE, &export)?;
    info!(path = %path.display(), samples = export.sample_size, "sample export written");
    Ok(path)
}
