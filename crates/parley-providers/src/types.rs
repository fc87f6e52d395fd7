//! Normalized request, response and catalog types

use chrono::{DateTime, Utc};
use parley_session::Message;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Backend-independent chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            stop_sequences: None,
            stream: true,
        }
    }

    /// Replayed context followed by the new user turn
    pub fn with_context(model_id: impl Into<String>, context: Vec<Message>, turn: Message) -> Self {
        let mut messages = context;
        messages.push(turn);
        Self::new(model_id, messages)
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop_sequences = Some(sequences);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Why generation ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    Cancelled,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Complete (non-streamed) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model_id: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: StopReason,
    pub response_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// One increment of a streamed response.
///
/// Only the final chunk carries usage and a stop reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    pub is_final: bool,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<StopReason>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            usage: None,
            stop_reason: None,
        }
    }

    pub fn finished(usage: TokenUsage, stop_reason: StopReason) -> Self {
        Self {
            text: String::new(),
            is_final: true,
            usage: Some(usage),
            stop_reason: Some(stop_reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Identifier used in API calls
    pub model_id: String,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// USD per million input tokens
    pub input_cost_per_million: f64,
    /// USD per million output tokens
    pub output_cost_per_million: f64,
    #[serde(default)]
    pub is_default: bool,
    /// Grouping label such as "fast" or "powerful"
    #[serde(default)]
    pub tier: Option<String>,
}

impl ModelInfo {
    pub(crate) fn catalog_entry(
        model_id: &str,
        display_name: &str,
        context_window: u32,
        max_output_tokens: u32,
        pricing: (f64, f64),
        tier: &str,
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            display_name: display_name.to_string(),
            context_window,
            max_output_tokens,
            input_cost_per_million: pricing.0,
            output_cost_per_million: pricing.1,
            is_default: false,
            tier: Some(tier.to_string()),
        }
    }

    pub(crate) fn default_model(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Pick the flagged default, falling back to the first listed model
pub(crate) fn default_model(models: &[ModelInfo]) -> Option<&ModelInfo> {
    models.iter().find(|m| m.is_default).or_else(|| models.first())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider_id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_configured: bool,
    pub models: Vec<ModelInfo>,
}

impl ProviderInfo {
    pub fn default_model(&self) -> Option<&ModelInfo> {
        default_model(&self.models)
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.model_id == model_id)
    }
}

/// How the API key is attached to requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Key sent in a named header, e.g. `x-api-key`
    Header(String),
    /// Key sent as a named query parameter
    Query(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    OpenAiCompatible,
    Anthropic,
}

/// Registration for a user-defined backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub display_name: String,
    /// Base URL, e.g. `http://localhost:11434/v1`
    pub api_endpoint: Url,
    pub auth: AuthStyle,
    pub models: Vec<ModelInfo>,
    pub supports_streaming: bool,
    pub api_format: ApiFormat,
}
