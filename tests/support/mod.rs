//! Shared helpers for integration tests: registries, components and fixtures.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use harvester_core::download::ClientSettings;
use harvester_core::extract::ItemPageSelectors;
use harvester_core::{
    Database, HttpClient, MetadataExtractor, Pipeline, PipelineSettings, RateLimiter, Registry,
    ResourceDownloader, RetryPolicy,
};
use tempfile::TempDir;

/// Opens a file-backed registry inside `dir`.
pub async fn file_registry(dir: &TempDir) -> Registry {
    let db = Database::new(&dir.path().join("harvester.db"))
        .await
        .expect("failed to open registry database");
    Registry::new(db)
}

pub fn client() -> HttpClient {
    HttpClient::new(&ClientSettings {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        ..ClientSettings::default()
    })
    .expect("failed to build client")
}

/// Three attempts with millisecond backoff.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20))
}

pub fn no_pacing() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::disabled())
}

pub fn extractor(registry: &Registry, root: &Path, max_item_attempts: u32) -> MetadataExtractor {
    MetadataExtractor::new(
        client(),
        registry.clone(),
        no_pacing(),
        ItemPageSelectors::default(),
        root.join("html"),
        max_item_attempts,
    )
}

pub fn downloader(registry: &Registry, root: &Path, max_item_attempts: u32) -> ResourceDownloader {
    ResourceDownloader::new(
        client(),
        registry.clone(),
        fast_policy(),
        no_pacing(),
        root.join("pdfs"),
        max_item_attempts,
    )
}

/// Pipeline without discovery sources.
pub fn pipeline(
    registry: &Registry,
    root: &Path,
    settings: PipelineSettings,
    max_item_attempts: u32,
) -> Pipeline {
    Pipeline::new(
        registry.clone(),
        extractor(registry, root, max_item_attempts),
        downloader(registry, root, max_item_attempts),
        settings,
    )
    .expect("valid pipeline settings")
}

/// One `oai_dc` record.
pub fn oai_record(header_id: &str, title: &str, identifiers: &[&str]) -> String {
    let identifiers: String = identifiers
        .iter()
        .map(|id| format!("<dc:identifier>{id}</dc:identifier>"))
        .collect();
    format!(
        r#"<record>
      <header><identifier>{header_id}</identifier><datestamp>2024-01-01</datestamp></header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title>{title}</dc:title>
          <dc:creator>Silva, A.</dc:creator>
          <dc:date>2021</dc:date>
          {identifiers}
        </oai_dc:dc>
      </metadata>
    </record>"#
    )
}

pub fn deleted_record(header_id: &str) -> String {
    format!(r#"<record><header status="deleted"><identifier>{header_id}</identifier></header></record>"#)
}

/// A `ListRecords` response wrapping `records`.
pub fn list_records(records: &[String], token: Option<&str>) -> String {
    let token = token
        .map(|t| format!(r#"<resumptionToken cursor="0">{t}</resumptionToken>"#))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-01-01T00:00:00Z</responseDate>
  <request verb="ListRecords">http://localhost/oai/request</request>
  <ListRecords>
    {}
    {token}
  </ListRecords>
</OAI-PMH>"#,
        records.join("\n")
    )
}

pub fn oai_error(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-01-01T00:00:00Z</responseDate>
  <request verb="ListRecords">http://localhost/oai/request</request>
  <error code="{code}">{message}</error>
</OAI-PMH>"#
    )
}

/// A DSpace-style item page. `pdf_href` adds a bitstream link.
pub fn item_page(title: &str, pdf_href: Option<&str>) -> String {
    let link = pdf_href
        .map(|href| format!(r#"<div class="file-link"><a href="{href}">Download</a></div>"#))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta name="DC.title" content="{title}">
  <meta name="DC.creator" content="Souza, B.">
  <meta name="DC.creator" content="Lima, C.">
  <meta name="DCTERMS.issued" content="2019-03-01">
  <meta name="DCTERMS.abstract" content="Estudo de campo.">
  <meta name="DC.subject" content="Soja">
  <meta name="citation_doi" content="10.1234/agro.2019.7">
</head>
<body>
  <h2 class="page-header">{title}</h2>
  {link}
</body>
</html>"#
    )
}

pub const PDF_BYTES: &[u8] = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n%%EOF\n";
