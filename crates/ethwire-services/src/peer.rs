//! Per-peer request state shared by both capabilities.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use ethwire_core::crypto::{short_id, NodeId};

/// What a peer has most recently been asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Asking {
    #[default]
    Nothing,
    State,
    BlockHeaders,
    BlockBodies,
    NodeData,
    Receipts,
    WarpManifest,
    WarpData,
}

impl fmt::Display for Asking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Asking::Nothing => "nothing",
            Asking::State => "state",
            Asking::BlockHeaders => "block headers",
            Asking::BlockBodies => "block bodies",
            Asking::NodeData => "node data",
            Asking::Receipts => "receipts",
            Asking::WarpManifest => "warp manifest",
            Asking::WarpData => "warp data",
        };
        f.write_str(name)
    }
}

/// One outstanding request at a time, with the moment it was issued.
#[derive(Debug, Clone)]
pub struct RequestState {
    asking: Asking,
    last_ask: Instant,
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            asking: Asking::Nothing,
            last_ask: Instant::now(),
        }
    }

    pub fn asking(&self) -> Asking {
        self.asking
    }

    pub fn is_idle(&self) -> bool {
        self.asking == Asking::Nothing
    }

    pub fn last_ask(&self) -> Instant {
        self.last_ask
    }

    /// Record a new request. Overlapping requests are logged and allowed;
    /// returns false when one was already outstanding.
    pub fn begin(&mut self, peer: &NodeId, asking: Asking) -> bool {
        let was_idle = self.is_idle() || asking == Asking::Nothing;
        if !was_idle {
            tracing::warn!(peer = %short_id(peer), "Asking {} while requesting {}", asking, self.asking);
        }
        self.asking = asking;
        self.last_ask = Instant::now();
        was_idle
    }

    pub fn complete(&mut self) {
        self.asking = Asking::Nothing;
    }

    /// True when a request has been outstanding for longer than `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_idle() && now.saturating_duration_since(self.last_ask) > timeout
    }
}
