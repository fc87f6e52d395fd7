//! Claude-style Messages API client

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
use crate::{Message, Result, Role};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const API_VERSION: &str = "2023-06-01";

const API_KEY_HEADER: &str = "x-api-key";
const VERSION_HEADER: &str = "anthropic-version";

/// Built-in Claude model catalog
pub fn catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo::catalog_entry(
            "claude-3-haiku-20240307",
            "Claude 3 Haiku",
            200_000,
            4096,
            (0.25, 1.25),
            "fast",
        )
        .default_model(),
        ModelInfo::catalog_entry(
            "claude-3-5-sonnet-20241022",
            "Claude 3.5 Sonnet",
            200_000,
            8192,
            (3.0, 15.0),
            "balanced",
        ),
        ModelInfo::catalog_entry(
            "claude-sonnet-4-20250514",
            "Claude Sonnet 4",
            200_000,
            16384,
            (3.0, 15.0),
            "balanced",
        ),
        ModelInfo::catalog_entry(
            "claude-opus-4-20250514",
            "Claude Opus 4",
            200_000,
            16384,
            (15.0, 75.0),
            "powerful",
        ),
    ]
}

pub struct AnthropicProvider {
    backend: HttpBackend,
    display_name: String,
    models: Vec<ModelInfo>,
    supports_streaming: bool,
}

impl AnthropicProvider {
    pub fn new(http: reqwest::Client, provider_id: &str, api_key: impl Into<String>) -> Self {
        Self {
            backend: HttpBackend {
                http,
                provider_id: provider_id.to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: api_key.into(),
                auth: AuthStyle::Header(API_KEY_HEADER.to_string()),
                extra_headers: vec![(VERSION_HEADER.to_string(), API_VERSION.to_string())],
            },
            display_name: "Claude".to_string(),
            models: catalog(),
            supports_streaming: true,
        }
    }

    /// Client for a user-registered backend speaking the Messages API
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

    fn body<'a>(&self, request: &'a ChatRequest, stream: bool) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &request.model_id,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(WireMessage::from)
                .collect(),
            system: request.system_prompt.as_deref().filter(|s| !s.is_empty()),
            temperature: request.temperature,
            stop_sequences: request.stop_sequences.as_deref(),
            stream,
        }
    }

    async fn post_messages(
        &self,
        body: &MessagesRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let builder = self.backend.request(Method::POST, "messages").json(body);
        self.backend.execute(builder, cancel).await
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
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
        let Some(model) = self.default_model() else {
            return false;
        };

        let probe = ChatRequest::new(model.model_id.clone(), vec![Message::user("Hi", 1)])
            .max_tokens(1)
            .streaming(false);
        let body = self.body(&probe, false);
        let builder = self
            .backend
            .request_with_key(Method::POST, "messages", api_key)
            .json(&body);

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
        let response = self.post_messages(&body, cancel).await?;
        let parsed: MessagesResponse = self.backend.read_json(response, cancel).await?;

        if parsed.content.is_empty() {
            return Err(ProviderError::invalid_response(
                self.provider_id(),
                "No content in response",
            ));
        }

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            model_id: parsed.model.unwrap_or_else(|| request.model_id.clone()),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            stop_reason: parsed
                .stop_reason
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
        let response = self.post_messages(&body, &cancel).await?;
        let decoder = AnthropicStreamDecoder::new(
            self.provider_id(),
            estimator::estimate_request_tokens(request),
        );

        tracing::debug!(provider = %self.provider_id(), model = %request.model_id, "Stream opened");
        Ok(self.backend.stream_body(response, decoder, cancel))
    }
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::Unknown,
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: message.role.as_str(),
            content: &message.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<DeltaUsage>,
    },
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    output_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Per-stream state for Messages API events
struct AnthropicStreamDecoder {
    provider_id: String,
    input_tokens: u32,
    output_tokens: Option<u32>,
    stop_reason: StopReason,
    text: String,
}

impl AnthropicStreamDecoder {
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

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, payload: &str) -> Result<Option<String>> {
        let event: StreamEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(provider = %self.provider_id, error = %e, "Skipping malformed event");
                return Ok(None);
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens;
                }
                Ok(None)
            }
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) if !text.is_empty() => {
                    self.text.push_str(&text);
                    Ok(Some(text))
                }
                _ => Ok(None),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(output) = usage.and_then(|u| u.output_tokens) {
                    self.output_tokens = Some(output);
                }
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = stop_reason(reason);
                }
                Ok(None)
            }
            StreamEvent::Error { error } => Err(ProviderError::invalid_response(
                &self.provider_id,
                format!("{}: {}", error.kind, error.message),
            )),
            StreamEvent::Other => Ok(None),
        }
    }

    fn finish(&mut self) -> StreamChunk {
        let output = self
            .output_tokens
            .unwrap_or_else(|| estimator::estimate_tokens(&self.text));
        StreamChunk::finished(TokenUsage::new(self.input_tokens, output), self.stop_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_server::serve_once;
    use futures_util::StreamExt;

    fn provider(base_url: &str) -> AnthropicProvider {
        AnthropicProvider::new(reqwest::Client::new(), "claude", "sk-test").with_base_url(base_url)
    }

    fn request() -> ChatRequest {
        ChatRequest::new(
            "claude-3-haiku-20240307",
            vec![Message::system("ignored"), Message::user("Hello", 2)],
        )
        .system_prompt("Be brief")
    }

    #[test]
    fn test_catalog_default() {
        let provider = AnthropicProvider::new(reqwest::Client::new(), "claude", "");
        assert!(!provider.is_configured());
        assert_eq!(provider.display_name(), "Claude");
        assert_eq!(
            provider.default_model().unwrap().model_id,
            "claude-3-haiku-20240307"
        );
        assert_eq!(provider.models().len(), 4);
    }

    #[test]
    fn test_body_moves_system_prompt() {
        let provider = provider("http://localhost");
        let request = request();
        let json = serde_json::to_value(provider.body(&request, true)).unwrap();
        assert_eq!(json["system"], "Be brief");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], true);
        assert!(json.get("stop_sequences").is_none());
    }

    #[test]
    fn test_decoder_events() {
        let mut decoder = AnthropicStreamDecoder::new("claude", 99);
        let events = [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"not json"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":7}}"#,
            r#"{"type":"message_stop"}"#,
        ];

        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| decoder.decode(e).unwrap())
            .collect();
        assert_eq!(texts, vec!["Hel", "lo"]);

        let last = decoder.finish();
        assert_eq!(last.usage, Some(TokenUsage::new(12, 7)));
        assert_eq!(last.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn test_decoder_estimates_missing_usage() {
        let mut decoder = AnthropicStreamDecoder::new("claude", 20);
        decoder
            .decode(r#"{"type":"content_block_delta","delta":{"text":"abcdefgh"}}"#)
            .unwrap();
        let last = decoder.finish();
        assert_eq!(last.usage, Some(TokenUsage::new(20, 2)));
        assert_eq!(last.stop_reason, Some(StopReason::Unknown));
    }

    #[test]
    fn test_decoder_error_event() {
        let mut decoder = AnthropicStreamDecoder::new("claude", 0);
        let err = decoder
            .decode(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
        assert!(err.to_string().contains("Overloaded"));
    }

    #[tokio::test]
    async fn test_send_parses_response() {
        let body = r#"{"id":"msg_1","model":"claude-3-haiku-20240307","content":[{"type":"text","text":"Hi "},{"type":"text","text":"there"}],"stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":3}}"#;
        let (base_url, captured) =
            serve_once("200 OK", &[("content-type", "application/json")], body).await;

        let response = provider(&base_url)
            .send(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.usage(), TokenUsage::new(9, 3));
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.response_id.as_deref(), Some("msg_1"));

        let captured = captured.await.unwrap();
        let head = captured.head.to_lowercase();
        assert!(head.starts_with("post /messages"));
        assert!(head.contains("x-api-key: sk-test"));
        assert!(head.contains("anthropic-version: 2023-06-01"));
        assert!(captured.body.contains(r#""system":"Be brief""#));
    }

    #[tokio::test]
    async fn test_send_rejects_empty_content() {
        let (base_url, _captured) = serve_once("200 OK", &[], r#"{"content":[]}"#).await;
        let err = provider(&base_url)
            .send(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_stream_relays_text_and_usage() {
        let body = concat!(
            "event: message_start\r\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\r\n\r\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hi\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let (base_url, _captured) =
            serve_once("200 OK", &[("content-type", "text/event-stream")], body).await;

        let stream = provider(&base_url)
            .stream(&request(), CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Hi");
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].usage, Some(TokenUsage::new(5, 2)));
        assert_eq!(chunks[1].stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_rate_limit_status() {
        let (base_url, _captured) =
            serve_once("429 Too Many Requests", &[("retry-after", "7")], "").await;
        let err = provider(&base_url)
            .stream(&request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProviderError::RateLimit {
                provider: "claude".into(),
                retry_after: Some(std::time::Duration::from_secs(7)),
            }
        );
    }

    #[tokio::test]
    async fn test_validate_key() {
        let (base_url, _captured) = serve_once("401 Unauthorized", &[], "{}").await;
        assert!(!provider(&base_url).validate_key("bad").await);

        let (base_url, captured) = serve_once("200 OK", &[], r#"{"content":[]}"#).await;
        assert!(provider(&base_url).validate_key("good").await);
        let captured = captured.await.unwrap();
        assert!(captured.head.to_lowercase().contains("x-api-key: good"));
        assert!(captured.body.contains(r#""max_tokens":1"#));

        assert!(!provider("http://127.0.0.1:9").validate_key("").await);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider("http://127.0.0.1:9")
            .send(&request(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
