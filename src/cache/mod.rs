use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;

pub mod single_flight;
use single_flight::SingleFlight;

/// Source of the proxy-to-remote-host latency figure. The production
/// implementation is [`crate::stats::StatsClient`]; tests substitute their
/// own.
#[async_trait]
pub trait StatsFetcher: Send + Sync {
    async fn proxy_latency(&self, session_id: &str) -> Result<Duration, FetchError>;
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: Duration,
    fetched_at: Instant,
}

/// Cached value plus a clear epoch. `clear` bumps the epoch; a fetch that
/// started before the bump skips its entry write on settle, so a cleared key
/// stays cleared even while a flight it no longer owns is still running.
#[derive(Debug, Default)]
struct KeyState {
    entry: Option<CacheEntry>,
    epoch: u64,
}

/// Time-bounded cache over a [`StatsFetcher`] with single-flight coalescing
/// and stale-fallback-on-failure. Values younger than the TTL are served
/// without a fetch; concurrent misses for one key share one fetch; a failed
/// fetch falls back to the cached value while it is within the staleness
/// ceiling.
pub struct MetricsCache {
    fetcher: Arc<dyn StatsFetcher>,
    entries: Arc<Mutex<HashMap<String, KeyState>>>,
    flights: SingleFlight<String, Duration, FetchError>,
    ttl: Duration,
    max_staleness: Duration,
}

impl MetricsCache {
    pub fn new(fetcher: Arc<dyn StatsFetcher>, ttl: Duration, max_staleness: Duration) -> Self {
        Self {
            fetcher,
            entries: Arc::new(Mutex::new(HashMap::new())),
            flights: SingleFlight::new(),
            ttl,
            max_staleness,
        }
    }

    /// Cached value if fresh, otherwise the (coalesced) result of a fetch.
    pub async fn get(&self, key: &str) -> Result<Duration, FetchError> {
        if let Some(value) = self.fresh_value(key) {
            return Ok(value);
        }
        self.fetch_with_fallback(key).await
    }

    /// Force a fetch regardless of TTL. Still coalesced with any fetch
    /// already in flight, and still subject to the stale fallback.
    pub async fn refresh(&self, key: &str) -> Result<Duration, FetchError> {
        self.fetch_with_fallback(key).await
    }

    /// Drop the entry and detach any in-flight fetch for `key`.
    pub fn clear(&self, key: &str) {
        {
            let mut entries = self.entries.lock();
            let state = entries.entry(key.to_string()).or_default();
            state.entry = None;
            state.epoch += 1;
        }
        self.flights.forget(&key.to_string());
        debug!(key, "metrics cache entry cleared");
    }

    fn fresh_value(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .and_then(|state| state.entry)
            .and_then(|entry| (entry.fetched_at.elapsed() < self.ttl).then_some(entry.value))
    }

    fn stale_value(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|state| state.entry).and_then(|entry| {
            (entry.fetched_at.elapsed() <= self.max_staleness).then_some(entry.value)
        })
    }

    async fn fetch_with_fallback(&self, key: &str) -> Result<Duration, FetchError> {
        let owned = key.to_string();
        let fetcher = self.fetcher.clone();
        let entries = self.entries.clone();
        let result = self
            .flights
            .run(owned.clone(), move || async move {
                let epoch = entries.lock().entry(owned.clone()).or_default().epoch;
                let value = fetcher.proxy_latency(&owned).await?;
                // The entry is only ever written by a completed fetch, and
                // only if the key was not cleared while it ran.
                let mut entries = entries.lock();
                let state = entries.entry(owned).or_default();
                if state.epoch == epoch {
                    state.entry = Some(CacheEntry {
                        value,
                        fetched_at: Instant::now(),
                    });
                }
                Ok(value)
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(err) => match self.stale_value(key) {
                Some(value) => {
                    warn!(key, error = %err, "stats fetch failed; serving stale latency");
                    Ok(value)
                }
                None => Err(err),
            },
        }
    }
}
