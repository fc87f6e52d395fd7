//! HTTP plumbing shared by the concrete clients

use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;

use crate::error::{map_status, ProviderError};
use crate::provider::ChunkStream;
use crate::sse::{decode_stream, StreamDecoder};
use crate::types::{AuthStyle, ChatResponse, StreamChunk};
use crate::Result;

/// Endpoint, credentials and connection pool for one client instance
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub http: reqwest::Client,
    pub provider_id: String,
    pub base_url: String,
    pub api_key: String,
    pub auth: AuthStyle,
    /// Headers sent on every request besides the credential
    pub extra_headers: Vec<(String, String)>,
}

impl HttpBackend {
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Build a request authorized with this instance's key
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_with_key(method, path, &self.api_key)
    }

    /// Build a request authorized with an arbitrary key
    pub fn request_with_key(&self, method: Method, path: &str, api_key: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, self.endpoint(path));
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match &self.auth {
            AuthStyle::Bearer => builder.bearer_auth(api_key),
            AuthStyle::Header(name) => builder.header(name.as_str(), api_key),
            AuthStyle::Query(name) => builder.query(&[(name.as_str(), api_key)]),
        }
    }

    /// Send and map transport failures and non-success statuses
    pub async fn execute(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            sent = builder.send() => sent,
        }
        .map_err(|e| ProviderError::from_transport(&self.provider_id, &e))?;

        self.check_status(response).await
    }

    async fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        tracing::warn!(
            provider = %self.provider_id,
            status = status.as_u16(),
            "Provider request failed"
        );

        Err(map_status(
            &self.provider_id,
            status.as_u16(),
            retry_after.as_deref(),
            &body,
        ))
    }

    /// Read a success body, treating empty or malformed JSON as invalid
    pub async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            body = response.text() => body,
        }
        .map_err(|e| ProviderError::from_transport(&self.provider_id, &e))?;

        if body.trim().is_empty() {
            return Err(ProviderError::invalid_response(&self.provider_id, "Empty response"));
        }

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::invalid_response(&self.provider_id, e.to_string()))
    }

    /// Decode a streaming body with the given protocol decoder
    pub fn stream_body<D: StreamDecoder>(
        &self,
        response: Response,
        decoder: D,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let provider_id = self.provider_id.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| ProviderError::from_transport(&provider_id, &e)));
        decode_stream(Box::pin(body), decoder, cancel)
    }
}

/// Present a complete response as a two-item stream, for backends that
/// cannot stream
pub(crate) fn single_response_stream(response: ChatResponse) -> ChunkStream {
    let usage = response.usage();
    let mut items = Vec::with_capacity(2);
    if !response.content.is_empty() {
        items.push(Ok(StreamChunk::text(response.content)));
    }
    items.push(Ok(StreamChunk::finished(usage, response.stop_reason)));
    Box::pin(futures_util::stream::iter(items))
}
