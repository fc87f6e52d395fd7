//! Application configuration
//!
//! Loaded from a TOML file; every field is optional and falls back to the
//! defaults below.

use parley_providers::{FactorySettings, ProviderConfig, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use parley_tabs::{RegistrySettings, TabDefaults, DEFAULT_MAX_LABEL_LEN, DEFAULT_MAX_TABS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CoreError;
use crate::Result;

const DATABASE_FILE: &str = "parley.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the state store and other local data
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/parley.db`
    pub database_path: Option<PathBuf>,
    pub max_tabs: usize,
    pub max_label_len: usize,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    pub request_timeout_secs: u64,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,
    /// Extra backends registered at startup
    pub custom_providers: Vec<ProviderConfig>,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            database_path: None,
            max_tabs: DEFAULT_MAX_TABS,
            max_label_len: DEFAULT_MAX_LABEL_LEN,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            default_temperature: DEFAULT_TEMPERATURE,
            request_timeout_secs: parley_providers::DEFAULT_TIMEOUT.as_secs(),
            anthropic_base_url: None,
            openai_base_url: None,
            custom_providers: Vec::new(),
        }
    }

    /// Read `path`, or use the defaults when it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;

        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tabs == 0 {
            return Err(CoreError::Config("max_tabs must be at least 1".to_string()));
        }
        if self.max_label_len == 0 {
            return Err(CoreError::Config("max_label_len must be at least 1".to_string()));
        }
        if self.default_max_tokens == 0 {
            return Err(CoreError::Config(
                "default_max_tokens must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(CoreError::Config(format!(
                "default_temperature {} is outside 0.0..=2.0",
                self.default_temperature
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DATABASE_FILE))
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_tabs: self.max_tabs,
            max_label_len: self.max_label_len,
            tab_defaults: TabDefaults {
                max_tokens: self.default_max_tokens,
                temperature: self.default_temperature,
            },
        }
    }

    pub fn factory_settings(&self) -> FactorySettings {
        FactorySettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            anthropic_base_url: self.anthropic_base_url.clone(),
            openai_base_url: self.openai_base_url.clone(),
        }
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("Parley"))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_providers::{ApiFormat, AuthStyle};

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("parley.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_tabs, 10);
        assert_eq!(config.max_label_len, 30);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/parley"
max_tabs = 3
openai_base_url = "http://localhost:8080/v1"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_tabs, 3);
        assert_eq!(config.default_max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/parley/parley.db")
        );
        assert_eq!(
            config.factory_settings().openai_base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert_eq!(config.registry_settings().max_tabs, 3);
    }

    #[test]
    fn test_custom_providers_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(
            &path,
            r#"
[[custom_providers]]
provider_id = "local"
display_name = "Local"
api_endpoint = "http://localhost:11434/v1"
supports_streaming = true
api_format = "open_ai_compatible"
auth = { type = "bearer" }

[[custom_providers.models]]
model_id = "llama3"
display_name = "Llama 3"
context_window = 8192
max_output_tokens = 2048
input_cost_per_million = 0.0
output_cost_per_million = 0.0
is_default = true
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let custom = &config.custom_providers[0];
        assert_eq!(custom.provider_id, "local");
        assert_eq!(custom.auth, AuthStyle::Bearer);
        assert_eq!(custom.api_format, ApiFormat::OpenAiCompatible);
        assert_eq!(custom.models[0].context_window, 8192);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");

        std::fs::write(&path, "max_tabs = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(CoreError::Config(_))));

        std::fs::write(&path, "max_tabs = \"many\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(CoreError::Config(_))));
    }
}
