use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::LatencyConfig;
use crate::error::LatencyError;
use crate::protocol::{ProbeMessage, epoch_ms};

pub mod state;
use state::{Action, ProbeStateMachine};

/// Updates emitted by a probe channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A probe/reply pair completed; `browser_to_proxy` is half the RTT.
    RoundTrip {
        browser_to_proxy: Duration,
        observed_at: u64,
    },
    /// Reconnect budget exhausted; no further probes will be attempted.
    Unavailable,
}

/// Long-lived probe channel to the proxy's `/latency/{sessionId}` endpoint.
/// Owns a background task that pings on a fixed cadence, turns matching pongs
/// into [`ChannelEvent::RoundTrip`]s, and reconnects with capped exponential
/// backoff when the socket drops.
pub struct ProbeChannel {
    shutdown: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ProbeChannel {
    /// Open a channel for `session_id`. Events arrive on the returned
    /// receiver until the channel is closed or gives up.
    pub fn open(
        config: &LatencyConfig,
        session_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), LatencyError> {
        let url = config.channel_url(session_id)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let machine = ProbeStateMachine::new(
            config.reconnect_base,
            config.reconnect_cap,
            config.max_reconnect_attempts,
        );
        let task = tokio::spawn(run_channel(
            url,
            session_id.to_string(),
            config.ping_interval,
            machine,
            event_tx,
            shutdown_rx,
        ));
        Ok((
            Self {
                shutdown: shutdown_tx,
                task: Some(task),
            },
            event_rx,
        ))
    }

    /// Close the channel, cancelling the ping timer and any pending
    /// reconnect. Idempotent and callable from any state.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ProbeChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_channel(
    url: String,
    session_id: String,
    ping_interval: Duration,
    mut machine: ProbeStateMachine,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        machine.connect_started();
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                machine.opened();
                debug!(session_id = %session_id, "latency channel open");
                run_open(stream, ping_interval, &mut machine, &events, &mut shutdown).await;
            }
            Err(err) => {
                debug!(session_id = %session_id, error = %err, "latency channel connect failed");
            }
        }
        match machine.connection_lost() {
            Some(Action::Reconnect { delay }) => {
                debug!(
                    session_id = %session_id,
                    attempt = machine.reconnect_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling latency channel reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Some(Action::GiveUp) => {
                warn!(
                    session_id = %session_id,
                    attempts = machine.reconnect_attempts(),
                    "latency channel unavailable; giving up"
                );
                let _ = events.send(ChannelEvent::Unavailable);
                return;
            }
            // Deliberate close in progress.
            _ => return,
        }
    }
}

async fn run_open(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping_interval: Duration,
    machine: &mut ProbeStateMachine,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut sink, mut source) = stream.split();
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                machine.close_requested();
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            _ = ticker.tick() => {
                if let Some(Action::SendPing { timestamp }) = machine.ping_due(epoch_ms()) {
                    let ping = ProbeMessage::Ping { timestamp };
                    match ping.encode() {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to encode latency ping"),
                    }
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, machine, events);
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "latency channel error");
                        return;
                    }
                }
            }
        }
    }
}

fn handle_text(
    text: &str,
    machine: &mut ProbeStateMachine,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    match ProbeMessage::decode(text) {
        Ok(ProbeMessage::Pong {
            client_timestamp, ..
        }) => {
            let now = epoch_ms();
            if let Some(browser_to_proxy) = machine.reply(client_timestamp, now) {
                let _ = events.send(ChannelEvent::RoundTrip {
                    browser_to_proxy,
                    observed_at: now,
                });
            }
        }
        Ok(ProbeMessage::Ping { .. }) => {}
        Err(err) => {
            debug!(error = %err, "dropping malformed latency message");
        }
    }
}
