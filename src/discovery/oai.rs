//! OAI-PMH `ListRecords` harvesting with Dublin Core metadata.
//!
//! The first request carries `metadataPrefix` (and `set`, if configured);
//! every later request carries only the `resumptionToken` from the previous
//! page. Pagination ends on an empty or absent token, on a token seen before,
//! at the record cap, or at the page ceiling.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DiscoveryError, DiscoverySource, DiscoveryStats, fetch_with_retry};
use crate::download::{HttpClient, RateLimiter, RetryPolicy};
use crate::extract::detect_doi;
use crate::registry::{ItemMetadata, ItemStatus, Registry};

/// Hard ceiling on pages per endpoint when none is configured.
pub const DEFAULT_MAX_PAGES: u32 = 500;

const NO_RECORDS_MATCH: &str = "noRecordsMatch";

// ==================== Wire format ====================

#[derive(Debug, Deserialize)]
struct OaiEnvelope {
    #[serde(rename = "error", default)]
    errors: Vec<OaiErrorElement>,
    #[serde(rename = "ListRecords")]
    list_records: Option<ListRecords>,
}

#[derive(Debug, Deserialize)]
struct OaiErrorElement {
    #[serde(rename = "@code")]
    code: String,
    #[serde(rename = "$text", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListRecords {
    #[serde(rename = "record", default)]
    records: Vec<OaiRecord>,
    #[serde(rename = "resumptionToken")]
    resumption_token: Option<ResumptionToken>,
}

#[derive(Debug, Deserialize)]
struct ResumptionToken {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiRecord {
    header: Option<OaiHeader>,
    metadata: Option<OaiMetadata>,
}

#[derive(Debug, Deserialize)]
struct OaiHeader {
    #[serde(rename = "@status")]
    status: Option<String>,
    identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiMetadata {
    #[serde(rename = "oai_dc:dc", alias = "dc")]
    dc: Option<DublinCore>,
}

#[derive(Debug, Deserialize)]
struct DcValue {
    #[serde(rename = "$text", default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct DublinCore {
    #[serde(rename = "dc:title", alias = "title", default)]
    title: Vec<DcValue>,
    #[serde(rename = "dc:creator", alias = "creator", default)]
    creator: Vec<DcValue>,
    #[serde(rename = "dc:subject", alias = "subject", default)]
    subject: Vec<DcValue>,
    #[serde(rename = "dc:description", alias = "description", default)]
    description: Vec<DcValue>,
    #[serde(rename = "dc:date", alias = "date", default)]
    date: Vec<DcValue>,
    #[serde(rename = "dc:identifier", alias = "identifier", default)]
    identifier: Vec<DcValue>,
    #[serde(rename = "dc:publisher", alias = "publisher", default)]
    publisher: Vec<DcValue>,
    #[serde(rename = "dc:type", alias = "type", default)]
    resource_type: Vec<DcValue>,
    #[serde(rename = "dc:language", alias = "language", default)]
    language: Vec<DcValue>,
}

fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_all(values: Vec<DcValue>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| clean_text(&v.text))
        .filter(|v| !v.is_empty())
        .collect()
}

fn first_of(values: Vec<DcValue>) -> Option<String> {
    clean_all(values).into_iter().next()
}

// ==================== Parsed records ====================

/// One record's header and Dublin Core fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OaiRecordFields {
    pub oai_identifier: String,
    pub deleted: bool,
    pub title: Option<String>,
    pub creators: Vec<String>,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub identifiers: Vec<String>,
    pub publisher: Option<String>,
    pub resource_type: Option<String>,
    pub language: Option<String>,
}

impl OaiRecordFields {
    /// Converts a wire record; `None` when its header carries no identifier.
    fn from_wire(record: OaiRecord) -> Option<Self> {
        let header = record.header?;
        let oai_identifier = header
            .identifier
            .as_deref()
            .map(clean_text)
            .filter(|id| !id.is_empty())?;
        let deleted = header
            .status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("deleted"));
        let dc = record.metadata.and_then(|m| m.dc).unwrap_or_default();
        Some(Self {
            oai_identifier,
            deleted,
            title: first_of(dc.title),
            creators: clean_all(dc.creator),
            subjects: clean_all(dc.subject),
            description: first_of(dc.description),
            date: first_of(dc.date),
            identifiers: clean_all(dc.identifier),
            publisher: first_of(dc.publisher),
            resource_type: first_of(dc.resource_type),
            language: first_of(dc.language),
        })
    }
}

fn is_http(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

impl OaiRecordFields {
    /// Item page URL for this record.
    ///
    /// Prefers a handle URL, then a JSPUI URL, then any `.html` page among
    /// the identifiers; otherwise builds `{endpoint origin}/handle/{suffix}`
    /// from the header identifier.
    #[must_use]
    pub fn item_identity(&self, endpoint: &Url) -> Option<String> {
        let http: Vec<&str> = self
            .identifiers
            .iter()
            .map(String::as_str)
            .filter(|v| is_http(v))
            .collect();

        let preferred = http
            .iter()
            .find(|v| v.contains("/handle/"))
            .or_else(|| http.iter().find(|v| v.contains("/jspui/")))
            .or_else(|| {
                http.iter()
                    .find(|v| v.to_ascii_lowercase().ends_with(".html"))
            });
        if let Some(url) = preferred {
            return Some((*url).to_string());
        }

        let suffix = self
            .oai_identifier
            .rsplit(':')
            .next()
            .map(|s| s.trim().trim_matches('/'))
            .filter(|s| !s.is_empty() && *s != self.oai_identifier.trim())?;
        let origin = endpoint.origin().ascii_serialization();
        Some(format!("{origin}/handle/{suffix}"))
    }

    /// First identifier that is a direct PDF link.
    #[must_use]
    pub fn pdf_url(&self) -> Option<&str> {
        self.identifiers
            .iter()
            .map(String::as_str)
            .find(|v| is_http(v) && v.to_ascii_lowercase().ends_with(".pdf"))
    }

    /// Metadata patch for the registry.
    #[must_use]
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            title: self.title.clone(),
            authors: self.creators.clone(),
            publication_date: self.date.clone(),
            abstract_text: self.description.clone(),
            subjects: self.subjects.clone(),
            doi: self.identifiers.iter().find_map(|v| detect_doi(v)),
            pdf_url: self.pdf_url().map(str::to_string),
            oai_identifier: Some(self.oai_identifier.clone()),
            publisher: self.publisher.clone(),
            language: self.language.clone(),
            resource_type: self.resource_type.clone(),
            ..ItemMetadata::default()
        }
    }
}

/// One parsed `ListRecords` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRecordsPage {
    pub records: Vec<OaiRecordFields>,
    /// Records dropped because their header had no identifier.
    pub malformed: u64,
    /// Trimmed token text; `None` when absent or empty.
    pub resumption_token: Option<String>,
}

/// Parses a `ListRecords` response body.
///
/// `noRecordsMatch` is an empty page, not an error. Records whose header
/// has no identifier are dropped and counted in `malformed`.
///
/// # Errors
///
/// Returns [`DiscoveryError::Protocol`] for malformed XML, any other OAI
/// error code, or a response without a `ListRecords` element.
pub fn parse_list_records(xml: &str, endpoint: &str) -> Result<ListRecordsPage, DiscoveryError> {
    let envelope: OaiEnvelope = quick_xml::de::from_str(xml)
        .map_err(|e| DiscoveryError::protocol(endpoint, format!("invalid OAI-PMH XML: {e}")))?;

    if !envelope.errors.is_empty() {
        if envelope.errors.iter().any(|e| e.code == NO_RECORDS_MATCH) {
            debug!(endpoint, "no records match");
            return Ok(ListRecordsPage::default());
        }
        let message = envelope
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, clean_text(&e.message)))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(DiscoveryError::protocol(endpoint, message));
    }

    let list = envelope
        .list_records
        .ok_or_else(|| DiscoveryError::protocol(endpoint, "response has no ListRecords element"))?;

    let total = list.records.len();
    let records: Vec<OaiRecordFields> = list
        .records
        .into_iter()
        .filter_map(OaiRecordFields::from_wire)
        .collect();
    let malformed = (total - records.len()) as u64;
    if malformed > 0 {
        warn!(endpoint, malformed, "records without an OAI identifier skipped");
    }

    Ok(ListRecordsPage {
        records,
        malformed,
        resumption_token: list
            .resumption_token
            .and_then(|t| t.value)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
    })
}

// ==================== Harvester ====================

/// Per-endpoint harvest settings.
#[derive(Debug, Clone)]
pub struct OaiSettings {
    /// Source name recorded on registered items.
    pub name: String,
    pub endpoint: String,
    pub metadata_prefix: String,
    pub set: Option<String>,
    /// Stop after this many live records.
    pub max_records: Option<usize>,
    /// Hard ceiling on requests.
    pub max_pages: u32,
    /// Pause between page requests.
    pub request_delay: Duration,
}

/// Harvests one OAI-PMH endpoint.
#[derive(Debug, Clone)]
pub struct OaiHarvester {
    settings: OaiSettings,
    endpoint: Url,
    client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl OaiHarvester {
    /// Creates a harvester for `settings.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Protocol`] if the endpoint is not an
    /// absolute http(s) URL.
    pub fn new(
        settings: OaiSettings,
        client: HttpClient,
        rate_limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Result<Self, DiscoveryError> {
        let endpoint = Url::parse(&settings.endpoint)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| DiscoveryError::protocol(&settings.endpoint, "endpoint is not an http(s) URL"))?;
        Ok(Self {
            settings,
            endpoint,
            client,
            rate_limiter,
            policy,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &OaiSettings {
        &self.settings
    }

    fn request_params<'a>(&'a self, token: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![("verb", "ListRecords")];
        match token {
            Some(token) => params.push(("resumptionToken", token)),
            None => {
                params.push(("metadataPrefix", self.settings.metadata_prefix.as_str()));
                if let Some(set) = self.settings.set.as_deref() {
                    params.push(("set", set));
                }
            }
        }
        params
    }

    async fn register(
        &self,
        registry: &Registry,
        record: &OaiRecordFields,
        stats: &mut DiscoveryStats,
    ) -> Result<bool, DiscoveryError> {
        if record.deleted {
            debug!(oai_identifier = %record.oai_identifier, "skipping deleted record");
            stats.skipped += 1;
            return Ok(false);
        }
        let Some(identity) = record.item_identity(&self.endpoint) else {
            warn!(oai_identifier = %record.oai_identifier, "record has no usable item URL");
            stats.skipped += 1;
            return Ok(false);
        };

        let status_if_new = if record.pdf_url().is_some() {
            ItemStatus::AwaitingDownload
        } else {
            ItemStatus::PdfLinkPending
        };

        match registry
            .upsert(&identity, &self.settings.name, status_if_new, &record.metadata())
            .await
        {
            Ok(outcome) => {
                if outcome.created {
                    stats.registered += 1;
                } else if outcome.changed {
                    stats.updated += 1;
                }
                Ok(true)
            }
            Err(crate::registry::RegistryError::InvalidIdentity(url)) => {
                warn!(oai_identifier = %record.oai_identifier, url = %url, "record has no usable item URL");
                stats.skipped += 1;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DiscoverySource for OaiHarvester {
    fn name(&self) -> &str {
        &self.settings.name
    }

    #[instrument(skip_all, fields(source = %self.settings.name, endpoint = %self.settings.endpoint))]
    async fn discover(
        &self,
        registry: &Registry,
        interrupted: &AtomicBool,
    ) -> Result<DiscoveryStats, DiscoveryError> {
        let mut stats = DiscoveryStats::default();
        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();
        let mut live_records = 0usize;
        let record_cap = self.settings.max_records.unwrap_or(usize::MAX);

        info!("starting OAI-PMH harvest");

        for page_number in 1..=self.settings.max_pages {
            if interrupted.load(Ordering::SeqCst) {
                info!("interrupted, stopping harvest");
                break;
            }
            if page_number > 1 && !self.settings.request_delay.is_zero() {
                tokio::time::sleep(self.settings.request_delay).await;
            }

            let params = self.request_params(token.as_deref());
            let page = match fetch_with_retry(
                &self.client,
                &self.rate_limiter,
                &self.policy,
                &self.settings.endpoint,
                &params,
            )
            .await
            .map_err(DiscoveryError::from)
            .and_then(|body| parse_list_records(&body, &self.settings.endpoint))
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(page = page_number, error = %e, "OAI page failed, ending harvest");
                    stats.failed_pages += 1;
                    break;
                }
            };
            stats.pages += 1;
            stats.skipped += page.malformed;
            debug!(page = page_number, records = page.records.len(), "fetched OAI page");

            for record in &page.records {
                if live_records >= record_cap {
                    break;
                }
                stats.seen += 1;
                if self.register(registry, record, &mut stats).await? {
                    live_records += 1;
                }
            }
            if live_records >= record_cap {
                info!(max_records = record_cap, "record cap reached");
                break;
            }

            let Some(next) = page.resumption_token else {
                break;
            };
            if !seen_tokens.insert(next.clone()) {
                warn!(token = %next, "resumption token repeated, stopping pagination");
                break;
            }
            token = Some(next);

            if page_number == self.settings.max_pages {
                warn!(max_pages = self.settings.max_pages, "page ceiling reached with more records pending");
            }
        }

        info!(
            pages = stats.pages,
            registered = stats.registered,
            updated = stats.updated,
            skipped = stats.skipped,
            "OAI-PMH harvest finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-01-01T00:00:00Z</responseDate>
  <request verb="ListRecords">https://repo.example/oai/request</request>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:repo.example:doc/100</identifier>
        <datestamp>2023-05-01</datestamp>
        <setSpec>col_1</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title xml:lang="pt_BR">Adubação   verde</dc:title>
          <dc:creator>Silva, A.</dc:creator>
          <dc:subject>Leguminosas</dc:subject>
          <dc:creator>Souza, B.</dc:creator>
          <dc:date>2020</dc:date>
          <dc:identifier>http://repo.example/handle/doc/100</dc:identifier>
          <dc:identifier>doi:10.1590/abc.2020</dc:identifier>
          <dc:publisher>Embrapa</dc:publisher>
          <dc:type>Artigo</dc:type>
          <dc:language>por</dc:language>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted">
        <identifier>oai:repo.example:doc/101</identifier>
      </header>
    </record>
    <resumptionToken completeListSize="3" cursor="0">tok-1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    fn endpoint() -> Url {
        Url::parse("https://repo.example/oai/request").unwrap()
    }

    #[test]
    fn test_parse_list_records() {
        let page = parse_list_records(PAGE, "test").unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.resumption_token.as_deref(), Some("tok-1"));

        let first = &page.records[0];
        assert_eq!(first.oai_identifier, "oai:repo.example:doc/100");
        assert!(!first.deleted);
        assert_eq!(first.title.as_deref(), Some("Adubação verde"));
        assert_eq!(first.creators, vec!["Silva, A.", "Souza, B."]);
        assert_eq!(first.identifiers.len(), 2);

        assert!(page.records[1].deleted);
    }

    #[test]
    fn test_record_metadata() {
        let page = parse_list_records(PAGE, "test").unwrap();
        let meta = page.records[0].metadata();
        assert_eq!(meta.doi.as_deref(), Some("10.1590/abc.2020"));
        assert_eq!(meta.publisher.as_deref(), Some("Embrapa"));
        assert_eq!(meta.resource_type.as_deref(), Some("Artigo"));
        assert_eq!(meta.language.as_deref(), Some("por"));
        assert_eq!(meta.oai_identifier.as_deref(), Some("oai:repo.example:doc/100"));
        assert!(meta.pdf_url.is_none());
    }

    #[test]
    fn test_empty_resumption_token_ends() {
        let xml = r#"<OAI-PMH><ListRecords>
            <record><header><identifier>oai:x:1</identifier></header></record>
            <resumptionToken completeListSize="1" cursor="0"/>
        </ListRecords></OAI-PMH>"#;
        let page = parse_list_records(xml, "test").unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.resumption_token.is_none());
    }

    #[test]
    fn test_record_without_identifier_is_dropped() {
        let xml = r#"<OAI-PMH><ListRecords>
            <record><header><identifier>oai:x:1</identifier></header></record>
            <record><header><datestamp>2024-01-01</datestamp></header></record>
            <record><header><identifier>   </identifier></header></record>
            <record><metadata/></record>
            <resumptionToken>next</resumptionToken>
        </ListRecords></OAI-PMH>"#;
        let page = parse_list_records(xml, "test").unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].oai_identifier, "oai:x:1");
        assert_eq!(page.malformed, 3);
        assert_eq!(page.resumption_token.as_deref(), Some("next"));
    }

    #[test]
    fn test_no_records_match_is_empty() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">No matching records</error></OAI-PMH>"#;
        let page = parse_list_records(xml, "test").unwrap();
        assert!(page.records.is_empty());
        assert!(page.resumption_token.is_none());
    }

    #[test]
    fn test_other_oai_error_is_protocol_failure() {
        let xml = r#"<OAI-PMH><error code="badResumptionToken">expired</error></OAI-PMH>"#;
        let err = parse_list_records(xml, "https://repo.example/oai").unwrap_err();
        assert!(matches!(err, DiscoveryError::Protocol { .. }));
        assert!(err.to_string().contains("badResumptionToken: expired"));
    }

    #[test]
    fn test_non_oai_body_is_protocol_failure() {
        let err = parse_list_records("<html><body>maintenance</body></html>", "x").unwrap_err();
        assert!(matches!(err, DiscoveryError::Protocol { .. }));
    }

    #[test]
    fn test_identity_priority() {
        let mut record = OaiRecordFields {
            oai_identifier: "oai:repo.example:doc/7".to_string(),
            identifiers: vec![
                "https://repo.example/page.html".to_string(),
                "https://repo.example/jspui/bitstream/7".to_string(),
                "https://repo.example/handle/doc/7".to_string(),
            ],
            ..OaiRecordFields::default()
        };
        assert_eq!(
            record.item_identity(&endpoint()).as_deref(),
            Some("https://repo.example/handle/doc/7")
        );

        record.identifiers.pop();
        assert_eq!(
            record.item_identity(&endpoint()).as_deref(),
            Some("https://repo.example/jspui/bitstream/7")
        );

        record.identifiers.pop();
        assert_eq!(
            record.item_identity(&endpoint()).as_deref(),
            Some("https://repo.example/page.html")
        );

        record.identifiers.clear();
        assert_eq!(
            record.item_identity(&endpoint()).as_deref(),
            Some("https://repo.example/handle/doc/7")
        );
    }

    #[test]
    fn test_identity_unusable_header() {
        let record = OaiRecordFields {
            oai_identifier: "no-colons".to_string(),
            ..OaiRecordFields::default()
        };
        assert!(record.item_identity(&endpoint()).is_none());
    }

    #[test]
    fn test_direct_pdf_identifier() {
        let record = OaiRecordFields {
            oai_identifier: "oai:repo.example:doc/8".to_string(),
            identifiers: vec![
                "https://repo.example/handle/doc/8".to_string(),
                "https://repo.example/bitstream/doc/8/1/file.PDF".to_string(),
            ],
            ..OaiRecordFields::default()
        };
        assert_eq!(
            record.pdf_url(),
            Some("https://repo.example/bitstream/doc/8/1/file.PDF")
        );
        assert_eq!(
            record.metadata().pdf_url.as_deref(),
            Some("https://repo.example/bitstream/doc/8/1/file.PDF")
        );
    }
}
