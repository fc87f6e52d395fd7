//! Parley Providers
//!
//! Everything that knows a backend's wire format lives here:
//! - Normalized request/response/chunk types shared by all backends
//! - Claude-style and OpenAI-style HTTP clients with SSE stream decoding
//! - A common error taxonomy and HTTP status mapping
//! - Credential lookup and the per-tab client factory

mod anthropic;
mod client;
mod error;
pub mod estimator;
mod factory;
mod openai;
mod provider;
mod secrets;
pub mod sse;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::{map_status, parse_retry_after, ProviderError, DEFAULT_TIMEOUT};
pub use factory::{
    FactorySettings, ProviderConstructor, ProviderFactory, ANTHROPIC_PROVIDER_ID, OPENAI_PROVIDER_ID,
};
pub use openai::OpenAiProvider;
pub use provider::{ChunkStream, LlmProvider};
pub use secrets::{MemorySecretStore, SecretStore};
pub use types::{
    ApiFormat, AuthStyle, ChatRequest, ChatResponse, ModelInfo, ProviderConfig, ProviderInfo,
    StopReason, StreamChunk, TokenUsage, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};

pub use parley_session::{Message, Role};

pub type Result<T> = std::result::Result<T, ProviderError>;
