//! Latency measurement and caching for a VNC proxy client: a probing
//! WebSocket channel to the proxy, a TTL cache over the proxy's stats
//! endpoint, and a monitor that merges both into end-to-end estimates.

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod stats;

pub use cache::{MetricsCache, StatsFetcher};
pub use channel::{ChannelEvent, ProbeChannel};
pub use config::LatencyConfig;
pub use error::{FetchError, LatencyError};
pub use monitor::{LatencyMonitor, Measurement};
pub use stats::StatsClient;
