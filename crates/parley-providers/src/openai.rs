//! OpenAI-style Chat Completions client

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::{single_response_stream, HttpBackend};
use crate::error::ProviderError;
use crate::estimator;
use crate::provider::{ChunkStream, LlmProvider};
use crate::sse::StreamDecoder;
use crate::types::{
    AuthStyle, ChatRequest, ChatResponse, ModelInfo, ProviderConfig, StopReason, StreamChunk,
    TokenUsage,
};
use crate::{Result, Role};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Built-in OpenAI model catalog
pub fn catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo::catalog_entry("gpt-4o-mini", "GPT-4o Mini", 128_000, 16384, (0.15, 0.60), "fast")
            .default_model(),
        ModelInfo::catalog_entry("gpt-4o", "GPT-4o", 128_000, 16384, (2.50, 10.0), "balanced"),
        ModelInfo::catalog_entry("gpt-4-turbo", "GPT-4 Turbo", 128_000, 4096, (10.0, 30.0), "powerful"),
        ModelInfo::catalog_entry("o1", "o1", 200_000, 100_000, (15.0, 60.0), "reasoning"),
    ]
}

pub struct OpenAiProvider {
    backend: HttpBackend,
    display_name: String,
    models: Vec<ModelInfo>,
    supports_streaming: bool,
}

impl OpenAiProvider {
    pub fn new(http: reqwest::Client, provider_id: &str, api_key: impl Into<String>) -> Self {
        Self {
            backend: HttpBackend {
                http,
                provider_id: provider_id.to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: api_key.into(),
                auth: AuthStyle::Bearer,
                extra_headers: Vec::new(),
            },
            display_name: "ChatGPT".to_string(),
            models: catalog(),
            supports_streaming: true,
        }
    }

    /// Client for any OpenAI-compatible backend, e.g. a local inference server
    pub fn from_config(
        http: reqwest::Client,
        config: &ProviderConfig,
        api_key: impl Into<String>,
    ) -> Self {
        let mut provider = Self::new(http, &config.provider_id, api_key)
            .with_base_url(config.api_endpoint.as_str());
        provider.backend.auth = config.auth.clone();
        provider.display_name = config.display_name.clone();
        provider.models = config.models.clone();
        provider.supports_streaming = config.supports_streaming;
        provider
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.backend.base_url = base_url.into();
        self
    }

    fn body<'a>(&self, request: &'a ChatRequest, stream: bool) -> CompletionsRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        CompletionsRequest {
            model: &request.model_id,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop_sequences.as_deref(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn post_completions(
        &self,
        body: &CompletionsRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let builder = self
            .backend
            .request(Method::POST, "chat/completions")
            .json(body);
        self.backend.execute(builder, cancel).await
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        &self.backend.provider_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn is_configured(&self) -> bool {
        !self.backend.api_key.is_empty()
    }

    async fn validate_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }

        let builder = self.backend.request_with_key(Method::GET, "models", api_key);
        match self.backend.execute(builder, &CancellationToken::new()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = %self.provider_id(), error = %e, "Key validation failed");
                false
            }
        }
    }

    fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChatResponse> {
        let body = self.body(request, false);
        let response = self.post_completions(&body, cancel).await?;
        let parsed: CompletionsResponse = self.backend.read_json(response, cancel).await?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::invalid_response(
                self.provider_id(),
                "No choices in response",
            ));
        };

        let content = choice.message.content.unwrap_or_default();
        let (input_tokens, output_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                estimator::estimate_request_tokens(request),
                estimator::estimate_tokens(&content),
            ),
        };

        Ok(ChatResponse {
            content,
            model_id: parsed.model.unwrap_or_else(|| request.model_id.clone()),
            input_tokens,
            output_tokens,
            stop_reason: choice
                .finish_reason
                .as_deref()
                .map(stop_reason)
                .unwrap_or_default(),
            response_id: parsed.id,
            received_at: Utc::now(),
        })
    }

    async fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        if !self.supports_streaming {
            let response = self.send(request, &cancel).await?;
            return Ok(single_response_stream(response));
        }

        let body = self.body(request, true);
        let response = self.post_completions(&body, &cancel).await?;
        let decoder = OpenAiStreamDecoder::new(
            self.provider_id(),
            estimator::estimate_request_tokens(request),
        );

        tracing::debug!(provider = %self.provider_id(), model = %request.model_id, "Stream opened");
        Ok(self.backend.stream_body(response, decoder, cancel))
    }
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::StopSequence,
        _ => StopReason::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Per-stream state for Chat Completions chunks
struct OpenAiStreamDecoder {
    provider_id: String,
    input_tokens: u32,
    output_tokens: Option<u32>,
    stop_reason: StopReason,
    text: String,
}

impl OpenAiStreamDecoder {
    fn new(provider_id: &str, estimated_input: u32) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            input_tokens: estimated_input,
            output_tokens: None,
            stop_reason: StopReason::Unknown,
            text: String::new(),
        }
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, payload: &str) -> Result<Option<String>> {
        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(provider = %self.provider_id, error = %e, "Skipping malformed chunk");
                return Ok(None);
            }
        };

        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = Some(usage.completion_tokens);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.stop_reason = stop_reason(reason);
        }

        match choice.delta.content {
            Some(text) if !text.is_empty() => {
                self.text.push_str(&text);
                Ok(Some(text))
            }
            _ => Ok(None),
        }
    }

    fn finish(&mut self) -> StreamChunk {
        let output = self
            .output_tokens
            .unwrap_or_else(|| estimator::estimate_tokens(&self.text));
        StreamChunk::finished(TokenUsage::new(self.input_tokens, output), self.stop_reason)
    }
}
