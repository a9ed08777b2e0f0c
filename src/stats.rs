use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::cache::StatsFetcher;
use crate::config::LatencyConfig;
use crate::error::FetchError;

/// Per-connection statistics reported by the proxy's performance endpoint.
/// Only `proxyToVNCLatency` is consumed here; the rest is kept for callers
/// that want the full picture.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub average_latency: f64,
    #[serde(default)]
    pub browser_to_proxy_latency: u64,
    // The proxy capitalizes the acronym; camelCase alone would look for
    // `proxyToVncLatency` and silently default to zero.
    #[serde(default, rename = "proxyToVNCLatency")]
    pub proxy_to_vnc_latency: u64,
    #[serde(default)]
    pub total_end_to_end_latency: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub connections: HashMap<String, ConnectionStats>,
}

/// Client for `GET /api/vnc/performance?sessionId={id}`.
pub struct StatsClient {
    client: Client,
    base_url: String,
}

impl StatsClient {
    pub fn new(config: &LatencyConfig) -> Self {
        // Conservative timeouts and no proxy: a wedged stats endpoint must
        // not stall the refresh loop indefinitely.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(4))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: config.base_http_url(),
        }
    }

    /// Fetch the full performance payload for a session.
    pub async fn performance(&self, session_id: &str) -> Result<PerformanceStats, FetchError> {
        let response = self
            .client
            .get(format!("{}/api/vnc/performance", self.base_url))
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;

        match response.status() {
            StatusCode::BAD_REQUEST => return Err(FetchError::BadRequest),
            StatusCode::UNAUTHORIZED => return Err(FetchError::SessionRejected),
            status if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            _ => {}
        }

        response
            .json::<PerformanceStats>()
            .await
            .map_err(|err| FetchError::Parse(err.to_string()))
    }
}

#[async_trait]
impl StatsFetcher for StatsClient {
    async fn proxy_latency(&self, session_id: &str) -> Result<Duration, FetchError> {
        let stats = self.performance(session_id).await?;
        let connection = stats
            .connections
            .get(session_id)
            .ok_or_else(|| FetchError::NoConnection(session_id.to_string()))?;
        Ok(Duration::from_millis(connection.proxy_to_vnc_latency))
    }
}
