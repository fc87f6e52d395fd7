//! Provider error taxonomy
//!
//! Every backend maps its failures onto the same set of kinds so callers
//! never need to know which wire protocol produced them.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Timeout reported when the transport does not say how long it waited
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Invalid API key or authentication failed for {provider}")]
    Authentication { provider: String },

    #[error("Rate limit exceeded for {provider}{}", retry_hint(.retry_after))]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Request to {provider} timed out after {} seconds", .after.as_secs())]
    Timeout { provider: String, after: Duration },

    #[error("{provider} is unavailable: {details}")]
    Unavailable { provider: String, details: String },

    #[error("Invalid response from {provider}: {details}")]
    InvalidResponse {
        provider: String,
        status: Option<u16>,
        details: String,
    },

    #[error("Context too long ({tokens} tokens), maximum for {model} is {max} tokens")]
    ContextTooLong { model: String, tokens: u32, max: u32 },

    #[error("Provider '{0}' is not configured, add an API key first")]
    NotConfigured(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request cancelled")]
    Cancelled,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(", retry after {}s", delay.as_secs()),
        None => String::new(),
    }
}

impl ProviderError {
    /// Stable code for display and logs
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProviderError::Authentication { .. } => Some("E001"),
            ProviderError::RateLimit { .. } => Some("E002"),
            ProviderError::Timeout { .. } => Some("E003"),
            ProviderError::Unavailable { .. } => Some("E004"),
            ProviderError::ContextTooLong { .. } => Some("E005"),
            ProviderError::InvalidResponse { .. } => Some("E006"),
            ProviderError::NotConfigured(_) => Some("E008"),
            ProviderError::InvalidArgument(_) | ProviderError::Cancelled => None,
        }
    }

    /// Whether the same request may succeed if sent again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Unavailable { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    pub(crate) fn invalid_response(provider: &str, details: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            status: None,
            details: details.into(),
        }
    }

    /// Classify a transport-level failure
    pub(crate) fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: provider.to_string(),
                after: DEFAULT_TIMEOUT,
            }
        } else if err.is_connect() || err.is_request() {
            ProviderError::Unavailable {
                provider: provider.to_string(),
                details: err.to_string(),
            }
        } else {
            ProviderError::invalid_response(provider, err.to_string())
        }
    }
}

/// Map a non-success HTTP status onto the shared taxonomy
pub fn map_status(
    provider: &str,
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> ProviderError {
    let provider = provider.to_string();
    match status {
        401 | 403 => ProviderError::Authentication { provider },
        429 => ProviderError::RateLimit {
            provider,
            retry_after: retry_after.and_then(parse_retry_after),
        },
        408 | 504 => ProviderError::Timeout {
            provider,
            after: DEFAULT_TIMEOUT,
        },
        502 | 503 => ProviderError::Unavailable {
            provider,
            details: format!("HTTP {status}"),
        },
        _ => {
            let body = body.trim();
            ProviderError::InvalidResponse {
                provider,
                status: Some(status),
                details: format!(
                    "HTTP {status}: {}",
                    if body.is_empty() { "Unknown error" } else { body }
                ),
            }
        }
    }
}

/// Parse a `Retry-After` header given either as delta seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delay = date.with_timezone(&Utc) - Utc::now();
    Some(delay.to_std().unwrap_or(Duration::ZERO))
}
