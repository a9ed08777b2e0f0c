use std::time::Duration;

use url::Url;

use crate::error::LatencyError;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);
const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_STALENESS: Duration = Duration::from_millis(30_000);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(10_000);
const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1000);
const DEFAULT_RECONNECT_CAP: Duration = Duration::from_millis(10_000);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Configuration for the latency subsystem: proxy endpoints plus the timing
/// knobs for probing, caching, and reconnect backoff.
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Base URL of the proxy (scheme optional, defaults to http).
    pub base_url: String,
    /// Cadence of probe pings while the channel is open.
    pub ping_interval: Duration,
    /// Age under which a cached stats value is served without a fetch.
    pub cache_ttl: Duration,
    /// Maximum cache age usable as a fallback when a fetch fails.
    pub max_staleness: Duration,
    /// Period of the aggregator's stats refresh timer.
    pub refresh_interval: Duration,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_base: Duration,
    /// Ceiling on the reconnect backoff delay.
    pub reconnect_cap: Duration,
    /// Reconnect attempts before the channel is declared unavailable.
    pub max_reconnect_attempts: u32,
}

impl LatencyConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_staleness: DEFAULT_MAX_STALENESS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_reconnect_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_cap = cap;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Normalized base HTTP URL for the stats endpoint.
    pub fn base_http_url(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{base}");
        }
        // Normalize localhost to avoid IPv6 (::1) preference
        if base.contains("localhost") {
            base = base.replace("localhost", "127.0.0.1");
        }
        base
    }

    /// WebSocket URL of the probe channel for one session.
    pub fn channel_url(&self, session_id: &str) -> Result<String, LatencyError> {
        let base = self.base_http_url();
        let ws_base = match base.strip_prefix("http") {
            Some(rest) => format!("ws{rest}"),
            None => return Err(LatencyError::InvalidUrl(base)),
        };
        let full = format!("{ws_base}/latency/{session_id}");
        Url::parse(&full).map_err(|err| LatencyError::InvalidUrl(format!("{full}: {err}")))?;
        Ok(full)
    }
}
