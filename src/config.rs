//! Harvest configuration loaded from a TOML file.
//!
//! Every section has defaults, so an empty file (or no file) yields a working
//! configuration that only lacks discovery sources.
//!
//! ```toml
//! [storage]
//! database_path = "data/harvester.db"
//!
//! [pipeline]
//! concurrency = 4
//!
//! [[oai]]
//! name = "alice"
//! endpoint = "https://www.alice.cnptia.embrapa.br/oai/request"
//! max_records = 200
//!
//! [selectors.item_page]
//! title = ["meta:DC.title", "css:h2.page-header"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::discovery::{DEFAULT_MAX_PAGES, OaiSettings, SEARCH_RESULTS, SearchSelectors, SearchSettings};
use crate::download::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_HOST_DELAY_MS, REQUEST_TIMEOUT_SECS};
use crate::download::{ClientSettings, RetryPolicy, default_user_agent};
use crate::extract::{ExtractError, ITEM_PAGE, ItemPageSelectors, SelectorChain};

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error(transparent)]
    Selector(#[from] ExtractError),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Selector chains per page type, then per field.
pub type SelectorConfig = BTreeMap<String, BTreeMap<String, SelectorChain>>;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub oai: Vec<OaiSourceConfig>,
    pub search: Option<SearchSourceConfig>,
    pub selectors: SelectorConfig,
}

/// Where state and files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub snapshot_root: PathBuf,
    pub download_root: PathBuf,
    pub report_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/harvester.db"),
            snapshot_root: PathBuf::from("data/html"),
            download_root: PathBuf::from("data/pdfs"),
            report_dir: PathBuf::from("data/reports"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Minimum gap between requests to one host; 0 disables pacing.
    pub host_delay_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            host_delay_ms: DEFAULT_HOST_DELAY_MS,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::download::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1_000,
            max_delay_ms: 32_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Items processed in parallel within a stage.
    pub concurrency: usize,
    /// Failed stage attempts before an item becomes `failed_permanent`.
    pub max_item_attempts: u32,
    /// Items taken by the extraction stage per run.
    pub extraction_cap: usize,
    /// Items taken by the download stage per run.
    pub download_cap: usize,
    /// Discovery source names to run; all configured sources when absent.
    pub enabled_sources: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_item_attempts: 3,
            extraction_cap: 500,
            download_cap: 500,
            enabled_sources: None,
        }
    }
}

fn default_metadata_prefix() -> String {
    "oai_dc".to_string()
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OaiSourceConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub request_delay_ms: u64,
}

impl OaiSourceConfig {
    #[must_use]
    pub fn to_settings(&self) -> OaiSettings {
        OaiSettings {
            name: self.name.clone(),
            endpoint: self.endpoint.trim().to_string(),
            metadata_prefix: self.metadata_prefix.clone(),
            set: self.set.clone().filter(|s| !s.trim().is_empty()),
            max_records: self.max_records,
            max_pages: self.max_pages,
            request_delay: Duration::from_millis(self.request_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSourceConfig {
    pub name: String,
    pub base_url: String,
    pub url_template: String,
    pub keywords: Vec<String>,
    pub max_pages: u32,
    pub max_items_per_keyword: Option<usize>,
    pub page_size: u32,
    pub readiness_timeout_secs: u64,
    pub request_delay_ms: u64,
}

impl Default for SearchSourceConfig {
    fn default() -> Self {
        Self {
            name: "keyword_search".to_string(),
            base_url: String::new(),
            url_template: "{base}/discover?query={keyword}&page={page}&rpp={page_size}".to_string(),
            keywords: Vec::new(),
            max_pages: 5,
            max_items_per_keyword: None,
            page_size: 20,
            readiness_timeout_secs: 30,
            request_delay_ms: 0,
        }
    }
}

impl SearchSourceConfig {
    #[must_use]
    pub fn to_settings(&self) -> SearchSettings {
        SearchSettings {
            name: self.name.clone(),
            base_url: self.base_url.trim().to_string(),
            url_template: self.url_template.clone(),
            keywords: self
                .keywords
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            max_pages: self.max_pages,
            max_items_per_keyword: self.max_items_per_keyword,
            page_size: self.page_size,
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            request_delay: Duration::from_millis(self.request_delay_ms),
        }
    }
}

fn require_http(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value.trim())
        .map_err(|_| ConfigError::invalid(field, format!("'{value}' is not a URL")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(field, format!("'{value}' is not http(s)")));
    }
    Ok(())
}

impl HarvestConfig {
    /// Reads and validates the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no run could work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::invalid("pipeline.concurrency", "must be at least 1"));
        }
        if self.pipeline.max_item_attempts == 0 {
            return Err(ConfigError::invalid("pipeline.max_item_attempts", "must be at least 1"));
        }
        if !(3..=5).contains(&self.retry.max_attempts) {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                format!("{} is outside 3..=5", self.retry.max_attempts),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.network.connect_timeout_secs == 0 || self.network.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("network", "timeouts must be at least 1 second"));
        }

        let mut names = std::collections::HashSet::new();
        for source in &self.oai {
            if source.name.trim().is_empty() {
                return Err(ConfigError::invalid("oai.name", "must not be empty"));
            }
            require_http("oai.endpoint", &source.endpoint)?;
            if source.max_pages == 0 {
                return Err(ConfigError::invalid("oai.max_pages", "must be at least 1"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::invalid(
                    "oai.name",
                    format!("duplicate source name '{}'", source.name),
                ));
            }
        }

        if let Some(search) = &self.search {
            require_http("search.base_url", &search.base_url)?;
            if !search.url_template.contains("{keyword}") {
                return Err(ConfigError::invalid(
                    "search.url_template",
                    "must contain a {keyword} placeholder",
                ));
            }
            if search.max_pages == 0 || search.page_size == 0 {
                return Err(ConfigError::invalid(
                    "search",
                    "max_pages and page_size must be at least 1",
                ));
            }
            if !names.insert(search.name.as_str()) {
                return Err(ConfigError::invalid(
                    "search.name",
                    format!("duplicate source name '{}'", search.name),
                ));
            }
        }

        for page_type in self.selectors.keys() {
            if page_type != ITEM_PAGE && page_type != SEARCH_RESULTS {
                return Err(ConfigError::invalid(
                    "selectors",
                    format!("unknown page type '{page_type}'"),
                ));
            }
        }
        self.item_page_selectors()?;
        self.search_selectors()?;
        Ok(())
    }

    #[must_use]
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.network.request_timeout_secs),
            user_agent: self
                .network
                .user_agent
                .clone()
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(default_user_agent),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    #[must_use]
    pub fn host_delay(&self) -> Duration {
        Duration::from_millis(self.network.host_delay_ms)
    }

    /// Item page selectors with configured overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Selector`] for an unknown field.
    pub fn item_page_selectors(&self) -> Result<ItemPageSelectors, ConfigError> {
        match self.selectors.get(ITEM_PAGE) {
            Some(overrides) => Ok(ItemPageSelectors::with_overrides(overrides)?),
            None => Ok(ItemPageSelectors::default()),
        }
    }

    /// Search page selectors with configured overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Selector`] for an unknown field.
    pub fn search_selectors(&self) -> Result<SearchSelectors, ConfigError> {
        match self.selectors.get(SEARCH_RESULTS) {
            Some(overrides) => Ok(SearchSelectors::with_overrides(overrides)?),
            None => Ok(SearchSelectors::default()),
        }
    }

    /// Whether the discovery source `name` should run.
    #[must_use]
    pub fn is_source_enabled(&self, name: &str) -> bool {
        self.pipeline
            .enabled_sources
            .as_ref()
            .is_none_or(|enabled| enabled.iter().any(|n| n == name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HarvestConfig::from_toml_str("").unwrap();
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.storage.database_path, PathBuf::from("data/harvester.db"));
        assert!(config.oai.is_empty());
        assert!(config.search.is_none());
        assert_eq!(config.host_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
            [storage]
            database_path = "/tmp/h.db"

            [network]
            host_delay_ms = 250
            user_agent = "test-agent/1.0"

            [retry]
            max_attempts = 5
            base_delay_ms = 100
            max_delay_ms = 2000

            [pipeline]
            concurrency = 8
            enabled_sources = ["alice"]

            [[oai]]
            name = "alice"
            endpoint = "https://www.alice.cnptia.embrapa.br/oai/request"
            set = "col_123"
            max_records = 50

            [[oai]]
            name = "infoteca"
            endpoint = "https://www.infoteca.cnptia.embrapa.br/oai/request"

            [search]
            base_url = "https://repo.example"
            keywords = ["soja", " milho "]

            [selectors.item_page]
            title = ["css:h1.titulo", "meta:DC.title"]

            [selectors.search_results]
            ready = ["css:ul.results"]
        "#;
        let config = HarvestConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.pipeline.concurrency, 8);
        assert_eq!(config.oai.len(), 2);
        assert_eq!(config.oai[0].metadata_prefix, "oai_dc");
        assert_eq!(config.oai[1].max_pages, DEFAULT_MAX_PAGES);
        assert!(config.is_source_enabled("alice"));
        assert!(!config.is_source_enabled("infoteca"));

        let settings = config.oai[0].to_settings();
        assert_eq!(settings.set.as_deref(), Some("col_123"));
        assert_eq!(settings.max_records, Some(50));

        let search = config.search.as_ref().unwrap().to_settings();
        assert_eq!(search.keywords, vec!["soja", "milho"]);
        assert_eq!(search.name, "keyword_search");

        assert_eq!(config.client_settings().user_agent, "test-agent/1.0");
        assert_eq!(config.retry_policy().max_attempts(), 5);
        assert_eq!(
            config.item_page_selectors().unwrap().title.rules()[0].to_string(),
            "css:h1.titulo"
        );
        assert_eq!(
            config.search_selectors().unwrap().ready.rules()[0].to_string(),
            "css:ul.results"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            "[pipeline]\nconcurrency = 0",
            "[retry]\nmax_attempts = 1",
            "[retry]\nmax_attempts = 2",
            "[retry]\nmax_attempts = 6",
            "[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100",
            "[[oai]]\nname = \"x\"\nendpoint = \"\"",
            "[[oai]]\nname = \"x\"\nendpoint = \"ftp://repo.example/oai\"",
            "[search]\nbase_url = \"https://repo.example\"\nurl_template = \"{base}/search\"",
            "[selectors.home_page]\ntitle = [\"css:h1\"]",
            "[selectors.item_page]\ncolour = [\"css:h1\"]",
        ];
        for raw in cases {
            assert!(
                HarvestConfig::from_toml_str(raw).is_err(),
                "expected rejection of: {raw}"
            );
        }
    }

    #[test]
    fn test_malformed_selector_rule_fails_parse() {
        let err = HarvestConfig::from_toml_str("[selectors.item_page]\ntitle = [\"h1\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(HarvestConfig::from_toml_str("[pipeline]\nworkers = 3").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = HarvestConfig::load(Path::new("/nonexistent/harvest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
