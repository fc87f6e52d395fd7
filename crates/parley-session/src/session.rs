//! Session data structure
//!
//! Holds the message log for one tab behind its own lock, so a session never
//! contends with the tab or registry locks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, Role};
use crate::Result;

/// Serializable session payload used for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub context_enabled: bool,
    pub total_tokens: u64,
    pub messages: Vec<Message>,
}

impl SessionData {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug)]
struct SessionState {
    messages: Vec<Message>,
    context_enabled: bool,
    total_tokens: u64,
}

#[derive(Debug)]
pub struct Session {
    /// Unique identifier
    id: String,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                messages: Vec::new(),
                context_enabled: true,
                total_tokens: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context_enabled(&self) -> bool {
        self.state.lock().context_enabled
    }

    pub fn set_context_enabled(&self, enabled: bool) {
        self.state.lock().context_enabled = enabled;
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn total_tokens(&self) -> u64 {
        self.state.lock().total_tokens
    }

    pub fn last_message(&self) -> Option<Message> {
        self.state.lock().messages.last().cloned()
    }

    /// Append a message, charging its current token count to the total
    pub fn append(&self, message: Message) {
        let mut state = self.state.lock();
        state.total_tokens += u64::from(message.token_count);
        state.messages.push(message);
    }

    /// Messages to replay on the next turn.
    ///
    /// Empty when context is disabled; otherwise every non-system message in
    /// conversation order. The returned vec is detached from the live log.
    pub fn context(&self) -> Vec<Message> {
        let state = self.state.lock();
        if !state.context_enabled {
            return Vec::new();
        }

        state
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }

    /// Full unfiltered history
    pub fn history(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.messages.clear();
        state.total_tokens = 0;
    }

    /// Replace provisional estimates of the last turn with reported usage.
    ///
    /// Only applies when the newest message is an assistant reply. The reply
    /// is re-priced at `output_tokens` and the user message that opened the
    /// turn at `input_tokens`, so the total picks up the prompt cost that the
    /// provisional figure never contained.
    pub fn reconcile_last_turn(&self, input_tokens: u32, output_tokens: u32) {
        let mut state = self.state.lock();
        let SessionState {
            messages,
            total_tokens,
            ..
        } = &mut *state;

        let Some(last_index) = messages.len().checked_sub(1) else {
            return;
        };
        if !messages[last_index].is_assistant() {
            return;
        }

        let assistant = &mut messages[last_index];
        *total_tokens -= u64::from(assistant.token_count);
        assistant.token_count = output_tokens;
        *total_tokens += u64::from(output_tokens);

        match messages[..last_index]
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::User)
        {
            Some(user) => {
                *total_tokens -= u64::from(user.token_count);
                user.token_count = input_tokens;
                *total_tokens += u64::from(input_tokens);
            }
            None => {
                tracing::debug!(
                    session_id = %self.id,
                    input_tokens,
                    "No user message opens this turn, input usage not recorded"
                );
            }
        }
    }

    pub fn export(&self) -> SessionData {
        let state = self.state.lock();
        SessionData {
            session_id: self.id.clone(),
            context_enabled: state.context_enabled,
            total_tokens: state.total_tokens,
            messages: state.messages.clone(),
        }
    }

    /// Replace the history with a persisted payload.
    ///
    /// The total is recomputed from the imported messages.
    pub fn import(&self, data: SessionData) {
        let mut state = self.state.lock();
        let total: u64 = data
            .messages
            .iter()
            .map(|m| u64::from(m.token_count))
            .sum();

        if total != data.total_tokens {
            tracing::warn!(
                session_id = %self.id,
                cached = data.total_tokens,
                recomputed = total,
                "Imported token total does not match messages, using recomputed value"
            );
        }

        state.messages = data.messages;
        state.context_enabled = data.context_enabled;
        state.total_tokens = total;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
