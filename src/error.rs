use thiserror::Error;

/// Failure of a stats-endpoint fetch. Clone-able so every caller joined to a
/// coalesced fetch can observe the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("stats request failed: {0}")]
    Network(String),
    #[error("stats endpoint rejected the request: session id missing")]
    BadRequest,
    #[error("stats endpoint rejected the session: invalid or expired")]
    SessionRejected,
    #[error("stats endpoint returned status {0}")]
    Status(u16),
    #[error("malformed stats payload: {0}")]
    Parse(String),
    #[error("no active connection for session '{0}'")]
    NoConnection(String),
}

/// Top-level error surface of the subsystem. Probe-channel failures are not
/// errors to the caller; they surface as
/// [`ChannelEvent::Unavailable`](crate::channel::ChannelEvent) after the
/// reconnect budget is spent.
#[derive(Debug, Error)]
pub enum LatencyError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Fetch(#[from] FetchError),
}
