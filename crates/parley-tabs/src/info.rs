//! Read-only views and persisted form of a tab

use chrono::{DateTime, Utc};
use parley_session::SessionData;
use serde::{Deserialize, Serialize};

use crate::state::StreamState;

/// Point-in-time view of a tab for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub label: String,
    pub provider_id: String,
    pub model_id: String,
    pub context_enabled: bool,
    pub max_tokens: u32,
    /// Position in the registry's display order
    pub order: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub stream_state: StreamState,
    pub is_streaming: bool,
    pub message_count: usize,
    pub total_tokens: u64,
}

/// Everything needed to rebuild a tab after restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub tab_id: String,
    pub label: String,
    pub provider_id: String,
    pub model_id: String,
    pub context_enabled: bool,
    pub max_tokens: u32,
    pub order: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Secret store alias the client was created with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_alias: Option<String>,
    pub session: SessionData,
}
