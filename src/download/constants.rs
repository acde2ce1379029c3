//! Network defaults shared by the HTTP client and configuration.

/// TCP connect timeout in seconds.
pub(crate) const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Whole-request timeout in seconds, including the body.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default minimum gap between requests to one host, in milliseconds.
pub(crate) const DEFAULT_HOST_DELAY_MS: u64 = 1000;
