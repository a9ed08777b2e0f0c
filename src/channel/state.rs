use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

/// What the runner should do next in response to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendPing { timestamp: u64 },
    Reconnect { delay: Duration },
    GiveUp,
}

/// Probe-channel lifecycle as a plain state machine. The runner feeds it
/// discrete events (connect started, opened, ping timer, reply, connection
/// lost, close requested) and executes the actions it returns; nothing in
/// here touches the network, so every transition is testable directly.
#[derive(Debug)]
pub struct ProbeStateMachine {
    state: ChannelState,
    reconnect_attempts: u32,
    outstanding: HashSet<u64>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ProbeStateMachine {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ChannelState::Disconnected,
            reconnect_attempts: 0,
            outstanding: HashSet::new(),
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_closing(&self) -> bool {
        self.state == ChannelState::Closing
    }

    pub fn connect_started(&mut self) {
        if self.state != ChannelState::Closing {
            self.state = ChannelState::Connecting;
        }
    }

    /// Channel established: attempts reset, any pings from a previous
    /// incarnation are no longer answerable.
    pub fn opened(&mut self) {
        if self.state == ChannelState::Closing {
            return;
        }
        self.state = ChannelState::Open;
        self.reconnect_attempts = 0;
        self.outstanding.clear();
    }

    /// Ping timer fired. Returns the probe to send, if the channel is open.
    pub fn ping_due(&mut self, now_ms: u64) -> Option<Action> {
        if self.state != ChannelState::Open {
            return None;
        }
        self.outstanding.insert(now_ms);
        Some(Action::SendPing { timestamp: now_ms })
    }

    /// A pong arrived. Returns the one-way browser-to-proxy estimate, or
    /// `None` for unmatched or duplicate replies, which are dropped.
    pub fn reply(&mut self, client_timestamp: u64, now_ms: u64) -> Option<Duration> {
        if self.state != ChannelState::Open {
            return None;
        }
        if !self.outstanding.remove(&client_timestamp) {
            return None;
        }
        // A reply from the future means the wall clock stepped backward
        // mid-flight; the sample is meaningless, so drop it.
        if client_timestamp > now_ms {
            return None;
        }
        let rtt = now_ms - client_timestamp;
        // One-way latency approximated as half the round trip, rounded.
        Some(Duration::from_millis((rtt + 1) / 2))
    }

    /// Connection errored or closed unexpectedly. Returns the reconnect
    /// schedule, or `GiveUp` once the attempt budget is spent. `None` when a
    /// deliberate close is in progress.
    pub fn connection_lost(&mut self) -> Option<Action> {
        match self.state {
            ChannelState::Closing | ChannelState::Disconnected => None,
            _ => {
                self.outstanding.clear();
                if self.reconnect_attempts < self.max_attempts {
                    self.reconnect_attempts += 1;
                    self.state = ChannelState::Reconnecting;
                    let shift = self.reconnect_attempts.min(16);
                    let delay = self.base_delay.saturating_mul(1u32 << shift);
                    Some(Action::Reconnect {
                        delay: delay.min(self.max_delay),
                    })
                } else {
                    self.state = ChannelState::Disconnected;
                    Some(Action::GiveUp)
                }
            }
        }
    }

    pub fn close_requested(&mut self) {
        self.state = ChannelState::Closing;
        self.outstanding.clear();
    }
}
