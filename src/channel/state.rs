use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Connection lifecycle state of an event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Backoff,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Backoff => "backoff",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every transition and inbound frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Successful connections so far. A change means events may have been missed.
    pub epoch: u64,
    /// Consecutive failed attempts since the last successful open
    pub retry_count: u32,
    /// Delay of the pending reconnect, while in `Backoff`
    pub next_retry_ms: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Idle,
            epoch: 0,
            retry_count: 0,
            next_retry_ms: None,
            last_activity: None,
        }
    }
}

impl ChannelStatus {
    /// Whether an epoch boundary was crossed between two observations
    pub fn crossed_epoch(&self, seen_epoch: u64) -> bool {
        self.epoch != seen_epoch
    }
}
