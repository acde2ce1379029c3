//! Per-host request pacing.
//!
//! Every network call in the harvester (OAI pages, search pages, item pages,
//! binary downloads) goes through one shared [`RateLimiter`], which enforces a
//! minimum gap between consecutive requests to the same host. Requests to
//! different hosts never wait on each other.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use harvester_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
//!
//! // First request to a host proceeds immediately
//! limiter.acquire("https://repo.example/handle/1/2").await;
//! // The next one to the same host waits out the remainder of 500ms
//! limiter.acquire("https://repo.example/bitstream/1/2/a.pdf").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warn once a single host has accumulated this much pacing delay.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Per-host rate limiter, shared as `Arc<RateLimiter>` across tasks.
///
/// The `DashMap` shard lock is released before awaiting the per-host mutex,
/// so a sleeping request never blocks other hosts.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// `None` until the first request to this host.
    last_request: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a limiter enforcing `delay` between requests to one host.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = delay.as_millis()))]
    pub fn new(delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            delay,
            hosts: DashMap::new(),
        }
    }

    /// A limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.delay.is_zero()
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits until a request to `url`'s host is allowed, then claims the slot.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.is_disabled() {
            return;
        }

        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone();

        let mut last_request = state.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                let wait = self.delay.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(wait);
                debug!(host = %host, wait_ms = wait.as_millis(), "pacing request");
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                    && cumulative.saturating_sub(wait) < CUMULATIVE_DELAY_WARNING_THRESHOLD
                {
                    warn!(
                        host = %host,
                        cumulative_secs = cumulative.as_secs(),
                        "host pacing has accumulated a long delay"
                    );
                }
                tokio::time::sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

/// Lowercased host of `url`, or `"unknown"` when it has none.
///
/// ```
/// use harvester_core::download::rate_limiter::extract_host;
///
/// assert_eq!(extract_host("https://Repo.Example/handle/1"), "repo.example");
/// assert_eq!(extract_host("http://localhost:8080/x"), "localhost");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}
