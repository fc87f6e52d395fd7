//! Provider registry and per-tab client construction

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::anthropic::{self, AnthropicProvider};
use crate::error::{ProviderError, DEFAULT_TIMEOUT};
use crate::openai::{self, OpenAiProvider};
use crate::provider::LlmProvider;
use crate::secrets::SecretStore;
use crate::types::{ApiFormat, ProviderConfig, ProviderInfo};
use crate::Result;

pub const ANTHROPIC_PROVIDER_ID: &str = "claude";
pub const OPENAI_PROVIDER_ID: &str = "openai";

/// Builds a client instance from an API key
pub type ProviderConstructor = Arc<dyn Fn(String) -> Arc<dyn LlmProvider> + Send + Sync>;

/// Connection settings shared by every client the factory builds
#[derive(Debug, Clone)]
pub struct FactorySettings {
    pub request_timeout: Duration,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_TIMEOUT,
            anthropic_base_url: None,
            openai_base_url: None,
        }
    }
}

struct ProviderEntry {
    info: ProviderInfo,
    constructor: ProviderConstructor,
    builtin: bool,
}

/// Creates provider clients on demand. Each tab gets its own instance.
pub struct ProviderFactory {
    http: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
    entries: RwLock<Vec<ProviderEntry>>,
}

impl ProviderFactory {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Result<Self> {
        Self::with_settings(secrets, FactorySettings::default())
    }

    pub fn with_settings(secrets: Arc<dyn SecretStore>, settings: FactorySettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ProviderError::InvalidArgument(format!("HTTP client: {e}")))?;

        let factory = Self {
            http,
            secrets,
            entries: RwLock::new(Vec::new()),
        };
        factory.register_builtins(&settings);
        Ok(factory)
    }

    fn register_builtins(&self, settings: &FactorySettings) {
        let http = self.http.clone();
        let base_url = settings.anthropic_base_url.clone();
        let claude: ProviderConstructor = Arc::new(move |api_key: String| -> Arc<dyn LlmProvider> {
            let provider = AnthropicProvider::new(http.clone(), ANTHROPIC_PROVIDER_ID, api_key);
            Arc::new(match &base_url {
                Some(url) => provider.with_base_url(url.clone()),
                None => provider,
            })
        });

        let http = self.http.clone();
        let base_url = settings.openai_base_url.clone();
        let openai: ProviderConstructor = Arc::new(move |api_key: String| -> Arc<dyn LlmProvider> {
            let provider = OpenAiProvider::new(http.clone(), OPENAI_PROVIDER_ID, api_key);
            Arc::new(match &base_url {
                Some(url) => provider.with_base_url(url.clone()),
                None => provider,
            })
        });

        let mut entries = self.entries.write();
        entries.push(ProviderEntry {
            info: ProviderInfo {
                provider_id: ANTHROPIC_PROVIDER_ID.to_string(),
                display_name: "Claude".to_string(),
                description: Some("Anthropic's Claude models".to_string()),
                is_configured: false,
                models: anthropic::catalog(),
            },
            constructor: claude,
            builtin: true,
        });
        entries.push(ProviderEntry {
            info: ProviderInfo {
                provider_id: OPENAI_PROVIDER_ID.to_string(),
                display_name: "ChatGPT".to_string(),
                description: Some("OpenAI's GPT models".to_string()),
                is_configured: false,
                models: openai::catalog(),
            },
            constructor: openai,
            builtin: true,
        });
    }

    /// Plug in a backend. Replaces a previous registration with the same id
    /// unless that one is built in.
    pub fn register(&self, info: ProviderInfo, constructor: ProviderConstructor) -> Result<()> {
        let id = info.provider_id.trim();
        if id.is_empty() {
            return Err(ProviderError::InvalidArgument("provider id is empty".to_string()));
        }

        let mut entries = self.entries.write();
        if let Some(pos) = entries.iter().position(|e| e.info.provider_id.eq_ignore_ascii_case(id)) {
            if entries[pos].builtin {
                return Err(ProviderError::InvalidArgument(format!(
                    "cannot override built-in provider '{id}'"
                )));
            }
            entries.remove(pos);
        }

        tracing::info!(provider = %id, "Registered provider");
        entries.push(ProviderEntry {
            info,
            constructor,
            builtin: false,
        });
        Ok(())
    }

    /// Register a user-defined backend speaking one of the supported formats
    pub fn register_custom(&self, config: ProviderConfig) -> Result<()> {
        let http = self.http.clone();
        let info = ProviderInfo {
            provider_id: config.provider_id.clone(),
            display_name: config.display_name.clone(),
            description: Some(format!("Custom provider at {}", config.api_endpoint)),
            is_configured: false,
            models: config.models.clone(),
        };

        let constructor: ProviderConstructor = match config.api_format {
            ApiFormat::Anthropic => Arc::new(move |api_key: String| -> Arc<dyn LlmProvider> {
                Arc::new(AnthropicProvider::from_config(http.clone(), &config, api_key))
            }),
            ApiFormat::OpenAiCompatible => Arc::new(move |api_key: String| -> Arc<dyn LlmProvider> {
                Arc::new(OpenAiProvider::from_config(http.clone(), &config, api_key))
            }),
        };

        self.register(info, constructor)
    }

    /// Build a client for `provider_id` using the key stored under `alias`
    pub async fn create(
        &self,
        provider_id: &str,
        alias: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>> {
        let id = provider_id.trim();
        if id.is_empty() {
            return Err(ProviderError::InvalidArgument("provider id is empty".to_string()));
        }

        let (canonical, constructor) = {
            let entries = self.entries.read();
            let entry = entries
                .iter()
                .find(|e| e.info.provider_id.eq_ignore_ascii_case(id))
                .ok_or_else(|| ProviderError::InvalidArgument(format!("unknown provider '{id}'")))?;
            (entry.info.provider_id.clone(), entry.constructor.clone())
        };

        let api_key = self
            .secrets
            .retrieve(&canonical, alias)
            .await
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ProviderError::NotConfigured(canonical.clone()))?;

        tracing::debug!(provider = %canonical, "Created provider client");
        Ok(constructor(api_key))
    }

    /// Every registered provider, in registration order
    pub fn available_providers(&self) -> Vec<ProviderInfo> {
        self.entries.read().iter().map(|e| e.info.clone()).collect()
    }

    /// Registered providers that have at least one stored key
    pub async fn configured_providers(&self) -> Vec<ProviderInfo> {
        let mut configured = Vec::new();
        for mut info in self.available_providers() {
            if self.secrets.exists(&info.provider_id, None).await {
                info.is_configured = true;
                configured.push(info);
            }
        }
        configured
    }

    pub fn is_available(&self, provider_id: &str) -> bool {
        self.provider_info(provider_id).is_some()
    }

    pub fn provider_info(&self, provider_id: &str) -> Option<ProviderInfo> {
        let id = provider_id.trim();
        self.entries
            .read()
            .iter()
            .find(|e| e.info.provider_id.eq_ignore_ascii_case(id))
            .map(|e| e.info.clone())
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        self.secrets.clone()
    }
}
