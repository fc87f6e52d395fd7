//! Application state container
//!
//! Owns the tab registry and the state store, and keeps the two in sync:
//! tabs are restored on startup and the tab list is saved whenever a tab
//! closes.

use std::sync::{Arc, Weak};

use parley_providers::{ProviderFactory, SecretStore};
use parley_storage::StateStore;
use parley_tabs::{RegistryEventKind, SubscriptionId, Tab, TabRegistry, TabSnapshot};

use crate::config::Config;
use crate::Result;

const ACTIVE_TAB_KEY: &str = "active_tab_id";

pub struct Workspace {
    config: Config,
    store: StateStore,
    factory: Arc<ProviderFactory>,
    registry: Arc<TabRegistry>,
    autosave: SubscriptionId,
}

impl Workspace {
    /// Open the state store under the configured data directory and wire
    /// up the provider factory and tab registry.
    pub fn new(config: Config, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = StateStore::open(&db_path)?;

        Self::with_store(config, secrets, store)
    }

    /// Like [`Workspace::new`], over an already open store
    pub fn with_store(
        config: Config,
        secrets: Arc<dyn SecretStore>,
        store: StateStore,
    ) -> Result<Self> {
        let factory = Arc::new(ProviderFactory::with_settings(
            secrets,
            config.factory_settings(),
        )?);
        for custom in &config.custom_providers {
            factory.register_custom(custom.clone())?;
        }

        let registry = Arc::new(TabRegistry::with_settings(
            Arc::clone(&factory),
            config.registry_settings(),
        ));

        let autosave = {
            let registry_ref: Weak<TabRegistry> = Arc::downgrade(&registry);
            let store = store.clone();
            registry.subscribe(RegistryEventKind::Closed, move |_| {
                let Some(registry) = registry_ref.upgrade() else {
                    return;
                };
                if let Err(e) = persist(&registry, &store) {
                    tracing::warn!(error = %e, "Auto-save after close failed");
                }
            })
        };

        Ok(Self {
            config,
            store,
            factory,
            registry,
            autosave,
        })
    }

    /// Restore saved tabs and the active tab. Returns how many tabs came back.
    pub async fn initialize(&self) -> Result<usize> {
        let snapshots: Vec<TabSnapshot> = self.store.load_tabs();
        let saved = snapshots.len();
        let restored = self.registry.restore(snapshots).await;

        if let Some(active) = self.store.get_setting(ACTIVE_TAB_KEY)? {
            if let Err(e) = self.registry.set_active(&active) {
                tracing::debug!(tab_id = %active, error = %e, "Saved active tab not restored");
            }
        }

        tracing::info!(saved, restored, "Workspace initialized");
        Ok(restored)
    }

    /// Persist every tab and the active tab id
    pub fn save_state(&self) -> Result<()> {
        persist(&self.registry, &self.store)
    }

    /// Save, then close every tab without overwriting what was just saved
    pub fn shutdown(&self) -> Result<()> {
        self.registry.unsubscribe(self.autosave);
        self.save_state()?;
        self.registry.close_all();
        tracing::info!("Workspace shut down");
        Ok(())
    }

    // === Tab operations ===

    pub async fn create_tab(&self, provider_id: &str, label: Option<&str>) -> Result<Arc<Tab>> {
        Ok(self.registry.create(provider_id, label).await?)
    }

    pub fn close_tab(&self, tab_id: &str) -> Result<()> {
        Ok(self.registry.close(tab_id)?)
    }

    pub fn set_active_tab(&self, tab_id: &str) -> Result<()> {
        Ok(self.registry.set_active(tab_id)?)
    }

    // === Settings ===

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.get_setting(key)?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.store.set_setting(key, value)?)
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        Ok(self.store.remove_setting(key)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<ProviderFactory> {
        &self.factory
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}

fn persist(registry: &TabRegistry, store: &StateStore) -> Result<()> {
    let snapshots = registry.export_states();
    store.save_tabs(&snapshots)?;

    match registry.active_tab_id() {
        Some(active) => store.set_setting(ACTIVE_TAB_KEY, &active)?,
        None => {
            store.remove_setting(ACTIVE_TAB_KEY)?;
        }
    }

    tracing::debug!(tabs = snapshots.len(), "Workspace state saved");
    Ok(())
}
