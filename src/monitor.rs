use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cache::{MetricsCache, StatsFetcher};
use crate::channel::{ChannelEvent, ProbeChannel};
use crate::config::LatencyConfig;
use crate::error::LatencyError;
use crate::protocol::epoch_ms;
use crate::stats::StatsClient;

/// One end-to-end latency estimate delivered to the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub browser_to_proxy: Duration,
    pub proxy_to_host: Duration,
    pub total_end_to_end: Duration,
    /// Epoch milliseconds at which this estimate was assembled.
    pub observed_at: u64,
}

impl Measurement {
    fn combine(browser_to_proxy: Duration, proxy_to_host: Duration) -> Self {
        Self {
            browser_to_proxy,
            proxy_to_host,
            total_end_to_end: browser_to_proxy + proxy_to_host,
            observed_at: epoch_ms(),
        }
    }
}

type MeasurementCallback = Arc<dyn Fn(Measurement) + Send + Sync>;

/// Most recent value from each of the two independent sources. Either side
/// may be unknown early on; unknown halves combine as zero, matching the
/// original client behavior.
#[derive(Default)]
struct LatestParts {
    browser_to_proxy: Option<Duration>,
    proxy_to_host: Option<Duration>,
}

struct ActiveSession {
    session_id: String,
    channel: ProbeChannel,
    event_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
    live: Arc<AtomicBool>,
}

/// Owns one probe channel and one cache refresh loop per active session and
/// merges their updates into [`Measurement`]s for a subscriber. Explicitly
/// constructed and disposed by the caller; holds no global state.
pub struct LatencyMonitor {
    config: LatencyConfig,
    cache: Arc<MetricsCache>,
    active: Mutex<Option<ActiveSession>>,
}

impl LatencyMonitor {
    pub fn new(config: LatencyConfig) -> Self {
        let fetcher: Arc<dyn StatsFetcher> = Arc::new(StatsClient::new(&config));
        Self::with_fetcher(config, fetcher)
    }

    /// Build a monitor over a custom stats source.
    pub fn with_fetcher(config: LatencyConfig, fetcher: Arc<dyn StatsFetcher>) -> Self {
        let cache = Arc::new(MetricsCache::new(
            fetcher,
            config.cache_ttl,
            config.max_staleness,
        ));
        Self {
            config,
            cache,
            active: Mutex::new(None),
        }
    }

    /// Start measuring for `session_id`, delivering every update to
    /// `on_measurement`. Any prior session is torn down first, clearing its
    /// cache entry.
    pub async fn connect(
        &self,
        session_id: &str,
        on_measurement: impl Fn(Measurement) + Send + Sync + 'static,
    ) -> Result<(), LatencyError> {
        self.disconnect().await;

        let (channel, events) = ProbeChannel::open(&self.config, session_id)?;
        let callback: MeasurementCallback = Arc::new(on_measurement);
        let latest = Arc::new(Mutex::new(LatestParts::default()));
        let live = Arc::new(AtomicBool::new(true));

        let event_task = tokio::spawn(fold_channel_events(
            session_id.to_string(),
            events,
            latest.clone(),
            callback.clone(),
            live.clone(),
        ));
        let refresh_task = tokio::spawn(run_refresh(
            session_id.to_string(),
            self.config.refresh_interval,
            self.cache.clone(),
            latest,
            callback,
            live.clone(),
        ));

        debug!(session_id = %session_id, "latency monitor connected");
        *self.active.lock() = Some(ActiveSession {
            session_id: session_id.to_string(),
            channel,
            event_task,
            refresh_task,
            live,
        });
        Ok(())
    }

    /// Tear down the active session: close the channel, cancel the refresh
    /// loop, clear the cache entry, drop the callback. Idempotent; safe to
    /// call before any `connect`.
    pub async fn disconnect(&self) {
        let session = self.active.lock().take();
        let Some(session) = session else {
            return;
        };
        let ActiveSession {
            session_id,
            mut channel,
            event_task,
            refresh_task,
            live,
        } = session;

        live.store(false, Ordering::SeqCst);
        channel.close().await;
        event_task.abort();
        refresh_task.abort();
        let _ = event_task.await;
        let _ = refresh_task.await;
        self.cache.clear(&session_id);
        debug!(session_id = %session_id, "latency monitor disconnected");
    }
}

impl Drop for LatencyMonitor {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.live.store(false, Ordering::SeqCst);
            session.event_task.abort();
            session.refresh_task.abort();
            // ProbeChannel's own Drop aborts the socket task.
        }
    }
}

async fn fold_channel_events(
    session_id: String,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    latest: Arc<Mutex<LatestParts>>,
    callback: MeasurementCallback,
    live: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        match event {
            ChannelEvent::RoundTrip {
                browser_to_proxy, ..
            } => {
                let proxy_to_host = {
                    let mut latest = latest.lock();
                    latest.browser_to_proxy = Some(browser_to_proxy);
                    latest.proxy_to_host.unwrap_or_default()
                };
                callback(Measurement::combine(browser_to_proxy, proxy_to_host));
            }
            ChannelEvent::Unavailable => {
                warn!(session_id = %session_id, "latency probe channel unavailable");
            }
        }
    }
}

async fn run_refresh(
    session_id: String,
    refresh_interval: Duration,
    cache: Arc<MetricsCache>,
    latest: Arc<Mutex<LatestParts>>,
    callback: MeasurementCallback,
    live: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !live.load(Ordering::SeqCst) {
            return;
        }
        match cache.get(&session_id).await {
            Ok(proxy_to_host) => {
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                let browser_to_proxy = {
                    let mut latest = latest.lock();
                    latest.proxy_to_host = Some(proxy_to_host);
                    latest.browser_to_proxy.unwrap_or_default()
                };
                callback(Measurement::combine(browser_to_proxy, proxy_to_host));
            }
            Err(err) => {
                // Keep the last good measurement; emit nothing broken.
                warn!(session_id = %session_id, error = %err, "latency stats refresh failed");
            }
        }
    }
}
