//! Request lifecycle of a tab
//!
//! ```text
//! Idle
//!   ↓ send
//! Streaming ──→ Idle         (final chunk, error, or stream dropped)
//!   ↓ cancel
//! Cancelled ──→ Idle         (request cleanup)
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// No request in flight
    #[default]
    Idle,
    /// A response is being relayed
    Streaming,
    /// Cancellation was requested, cleanup has not run yet
    Cancelled,
}

impl StreamState {
    pub fn can_transition_to(&self, target: StreamState) -> bool {
        match (self, target) {
            (StreamState::Idle, StreamState::Streaming) => true,
            (StreamState::Streaming, StreamState::Idle) => true,
            (StreamState::Streaming, StreamState::Cancelled) => true,
            (StreamState::Cancelled, StreamState::Idle) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamState::Streaming)
    }

    /// True while a request still holds the tab
    pub fn is_busy(&self) -> bool {
        !matches!(self, StreamState::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StreamState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(StreamState::Idle),
            "streaming" => Ok(StreamState::Streaming),
            "cancelled" => Ok(StreamState::Cancelled),
            _ => Err(format!("Unknown stream state: {}", s)),
        }
    }
}
