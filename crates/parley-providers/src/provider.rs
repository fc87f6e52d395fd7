//! Provider capability set
//!
//! Each backend implements [`LlmProvider`]; tabs, sessions and the registry
//! only ever see this trait.

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::estimator;
use crate::types::{default_model, ChatRequest, ChatResponse, ModelInfo, StreamChunk};
use crate::Result;

/// Lazy, single-pass sequence of chunks for one request.
///
/// A successful stream ends with exactly one final chunk. A failed or
/// cancelled stream ends with an `Err` item instead.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// True when the instance holds a non-empty API key
    fn is_configured(&self) -> bool;

    /// Check a key against the backend. Every failure is reported as `false`.
    async fn validate_key(&self, api_key: &str) -> bool;

    fn models(&self) -> &[ModelInfo];

    fn default_model(&self) -> Option<&ModelInfo> {
        default_model(self.models())
    }

    fn model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models().iter().find(|m| m.model_id == model_id)
    }

    fn estimate_tokens(&self, text: &str) -> u32 {
        estimator::estimate_tokens(text)
    }

    fn estimate_request_tokens(&self, request: &ChatRequest) -> u32 {
        estimator::estimate_request_tokens(request)
    }

    async fn send(&self, request: &ChatRequest, cancel: &CancellationToken)
        -> Result<ChatResponse>;

    async fn stream(&self, request: &ChatRequest, cancel: CancellationToken)
        -> Result<ChunkStream>;
}
