//! Credential lookup
//!
//! Keys are stored per provider under an alias so one provider can hold
//! several accounts. Persistence is left to the implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::Result;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn store(&self, provider_id: &str, alias: &str, api_key: &str) -> Result<()>;

    /// Look up a key. Without an alias the first alias in sorted order wins.
    async fn retrieve(&self, provider_id: &str, alias: Option<&str>) -> Option<String>;

    /// Returns whether anything was removed
    async fn delete(&self, provider_id: &str, alias: &str) -> bool;

    async fn exists(&self, provider_id: &str, alias: Option<&str>) -> bool {
        self.retrieve(provider_id, alias).await.is_some()
    }

    async fn list_aliases(&self, provider_id: &str) -> Vec<String>;

    async fn list_configured_providers(&self) -> Vec<String>;
}

/// Process-local store, used by tests and embedders without a keychain
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    keys: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor holding a single key
    pub fn with_key(provider_id: &str, alias: &str, api_key: &str) -> Self {
        let store = Self::new();
        store
            .keys
            .write()
            .entry(provider_id.to_lowercase())
            .or_default()
            .insert(alias.to_string(), api_key.to_string());
        store
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(&self, provider_id: &str, alias: &str, api_key: &str) -> Result<()> {
        if provider_id.trim().is_empty() || alias.trim().is_empty() {
            return Err(ProviderError::InvalidArgument(
                "provider id and alias are required".to_string(),
            ));
        }
        if api_key.trim().is_empty() {
            return Err(ProviderError::InvalidArgument("API key is empty".to_string()));
        }

        self.keys
            .write()
            .entry(provider_id.to_lowercase())
            .or_default()
            .insert(alias.to_string(), api_key.to_string());

        tracing::info!(provider = %provider_id, alias = %alias, "Stored API key");
        Ok(())
    }

    async fn retrieve(&self, provider_id: &str, alias: Option<&str>) -> Option<String> {
        let keys = self.keys.read();
        let aliases = keys.get(&provider_id.to_lowercase())?;
        match alias {
            Some(alias) => aliases.get(alias).cloned(),
            None => aliases.values().next().cloned(),
        }
    }

    async fn delete(&self, provider_id: &str, alias: &str) -> bool {
        let mut keys = self.keys.write();
        let provider = provider_id.to_lowercase();
        let Some(aliases) = keys.get_mut(&provider) else {
            return false;
        };

        let removed = aliases.remove(alias).is_some();
        if aliases.is_empty() {
            keys.remove(&provider);
        }
        removed
    }

    async fn list_aliases(&self, provider_id: &str) -> Vec<String> {
        self.keys
            .read()
            .get(&provider_id.to_lowercase())
            .map(|aliases| aliases.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn list_configured_providers(&self) -> Vec<String> {
        self.keys.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let store = MemorySecretStore::new();
        store.store("openai", "work", "sk-work").await.unwrap();
        store.store("OpenAI", "home", "sk-home").await.unwrap();

        assert_eq!(store.retrieve("openai", Some("work")).await.as_deref(), Some("sk-work"));
        // "home" sorts before "work"
        assert_eq!(store.retrieve("openai", None).await.as_deref(), Some("sk-home"));
        assert_eq!(store.list_aliases("openai").await, vec!["home", "work"]);
        assert!(store.retrieve("claude", None).await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_values() {
        let store = MemorySecretStore::new();
        assert!(matches!(
            store.store("openai", "default", "  ").await,
            Err(ProviderError::InvalidArgument(_))
        ));
        assert!(store.store("", "default", "sk").await.is_err());
        assert!(store.list_configured_providers().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemorySecretStore::with_key("claude", "default", "sk-ant");
        assert!(store.exists("claude", None).await);
        assert!(!store.delete("claude", "other").await);
        assert!(store.delete("claude", "default").await);
        assert!(!store.exists("claude", Some("default")).await);
        assert!(store.list_configured_providers().await.is_empty());
    }
}
