use serde::{Deserialize, Serialize};

/// Messages exchanged on the `/latency/{sessionId}` channel. The proxy echoes
/// each ping's timestamp back in the pong so replies can be correlated with
/// the probe that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeMessage {
    Ping {
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
}

impl ProbeMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Current wall-clock time in epoch milliseconds, as carried on the wire.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
