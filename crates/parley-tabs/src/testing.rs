//! Scripted provider for exercising tabs without a network

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use parley_providers::{
    ChatRequest, ChatResponse, ChunkStream, LlmProvider, MemorySecretStore, ModelInfo,
    ProviderError, ProviderFactory, ProviderInfo, StopReason, StreamChunk, TokenUsage,
};

pub const SCRIPTED: &str = "scripted";
/// Registered, but no key is ever stored for it
pub const KEYLESS: &str = "keyless";
pub const CONTEXT_WINDOW: u32 = 1000;

pub type RequestLog = Arc<Mutex<Vec<ChatRequest>>>;

fn model(id: &str, is_default: bool) -> ModelInfo {
    ModelInfo {
        model_id: id.to_string(),
        display_name: id.to_uppercase(),
        context_window: CONTEXT_WINDOW,
        max_output_tokens: 512,
        input_cost_per_million: 1.0,
        output_cost_per_million: 2.0,
        is_default,
        tier: None,
    }
}

fn info(provider_id: &str) -> ProviderInfo {
    ProviderInfo {
        provider_id: provider_id.to_string(),
        display_name: "Scripted".to_string(),
        description: None,
        is_configured: false,
        models: vec![model("small", true), model("large", false)],
    }
}

/// Replies depend on the last message:
/// - `fail...`: `stream` itself fails
/// - `hang...`: one chunk, then nothing until cancelled
/// - `broken...`: one chunk, then a transport error
/// - anything else: echoed back in two chunks plus the final chunk
pub struct ScriptedProvider {
    id: String,
    usage: Option<TokenUsage>,
    log: RequestLog,
    models: Vec<ModelInfo>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        "Scripted"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn validate_key(&self, api_key: &str) -> bool {
        !api_key.is_empty()
    }

    fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    async fn send(
        &self,
        request: &ChatRequest,
        _cancel: &CancellationToken,
    ) -> parley_providers::Result<ChatResponse> {
        self.log.lock().push(request.clone());
        let text = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatResponse {
            content: format!("echo: {text}"),
            model_id: request.model_id.clone(),
            input_tokens: 1,
            output_tokens: 1,
            stop_reason: StopReason::EndTurn,
            response_id: None,
            received_at: Utc::now(),
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        _cancel: CancellationToken,
    ) -> parley_providers::Result<ChunkStream> {
        self.log.lock().push(request.clone());
        let text = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();

        if text.starts_with("fail") {
            return Err(ProviderError::Unavailable {
                provider: self.id.clone(),
                details: "scripted outage".to_string(),
            });
        }
        if text.starts_with("hang") {
            let head = stream::iter(vec![Ok::<_, ProviderError>(StreamChunk::text("partial"))]);
            return Ok(Box::pin(head.chain(stream::pending())));
        }
        if text.starts_with("broken") {
            return Ok(Box::pin(stream::iter(vec![
                Ok(StreamChunk::text("partial")),
                Err(ProviderError::Unavailable {
                    provider: self.id.clone(),
                    details: "connection reset".to_string(),
                }),
            ])));
        }

        let last = StreamChunk {
            text: String::new(),
            is_final: true,
            usage: self.usage,
            stop_reason: Some(StopReason::EndTurn),
        };
        Ok(Box::pin(stream::iter(vec![
            Ok::<_, ProviderError>(StreamChunk::text("echo: ")),
            Ok(StreamChunk::text(text)),
            Ok(last),
        ])))
    }
}

/// Factory with the scripted backend (keyed) and a keyless one registered
pub fn factory(usage: Option<TokenUsage>) -> (Arc<ProviderFactory>, RequestLog) {
    let secrets = Arc::new(MemorySecretStore::with_key(SCRIPTED, "default", "sk-scripted"));
    let factory = ProviderFactory::new(secrets).unwrap();
    let log: RequestLog = Arc::default();

    for id in [SCRIPTED, KEYLESS] {
        let log = log.clone();
        let provider_id = id.to_string();
        factory
            .register(
                info(id),
                Arc::new(move |_key: String| -> Arc<dyn LlmProvider> {
                    Arc::new(ScriptedProvider {
                        id: provider_id.clone(),
                        usage,
                        log: log.clone(),
                        models: info(&provider_id).models,
                    })
                }),
            )
            .unwrap();
    }

    (Arc::new(factory), log)
}
