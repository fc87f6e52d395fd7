//! Tab Registry
//!
//! Owns every open tab, their display order and the active tab pointer.
//! The map, order list and active id live under one lock so they can never
//! be observed out of step.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use parley_providers::ProviderFactory;

use crate::error::TabError;
use crate::events::{Observer, Observers, RegistryEvent, RegistryEventKind, SubscriptionId};
use crate::info::{TabInfo, TabSnapshot};
use crate::tab::{Tab, TabDefaults};
use crate::Result;

pub const DEFAULT_MAX_TABS: usize = 10;
pub const DEFAULT_MAX_LABEL_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    pub max_tabs: usize,
    /// Labels longer than this many characters are truncated
    pub max_label_len: usize,
    pub tab_defaults: TabDefaults,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_tabs: DEFAULT_MAX_TABS,
            max_label_len: DEFAULT_MAX_LABEL_LEN,
            tab_defaults: TabDefaults::default(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    tabs: HashMap<String, Arc<Tab>>,
    order: Vec<String>,
    active: Option<String>,
}

impl RegistryState {
    fn renumber(&self) {
        for (index, id) in self.order.iter().enumerate() {
            if let Some(tab) = self.tabs.get(id) {
                tab.set_order(index);
            }
        }
    }

    /// Append to the order; the first tab in becomes active
    fn insert(&mut self, tab: Arc<Tab>) {
        let id = tab.id().to_string();
        tab.set_order(self.order.len());
        self.order.push(id.clone());
        self.tabs.insert(id.clone(), tab);

        if self.active.is_none() {
            self.active = Some(id);
        }
    }
}

pub struct TabRegistry {
    factory: Arc<ProviderFactory>,
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
    observers: Observers,
}

impl TabRegistry {
    pub fn new(factory: Arc<ProviderFactory>) -> Self {
        Self::with_settings(factory, RegistrySettings::default())
    }

    pub fn with_settings(factory: Arc<ProviderFactory>, settings: RegistrySettings) -> Self {
        Self {
            factory,
            settings,
            state: Mutex::new(RegistryState::default()),
            observers: Observers::default(),
        }
    }

    pub fn factory(&self) -> &Arc<ProviderFactory> {
        &self.factory
    }

    pub fn max_tabs(&self) -> usize {
        self.settings.max_tabs
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().tabs.len()
    }

    pub fn active_tab_id(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    pub fn active_tab(&self) -> Option<Arc<Tab>> {
        let state = self.state.lock();
        state.active.as_ref().and_then(|id| state.tabs.get(id).cloned())
    }

    pub fn get(&self, tab_id: &str) -> Result<Arc<Tab>> {
        self.state
            .lock()
            .tabs
            .get(tab_id)
            .cloned()
            .ok_or_else(|| TabError::NotFound(tab_id.to_string()))
    }

    /// Infos of all tabs in display order
    pub fn tabs(&self) -> Vec<TabInfo> {
        self.ordered().iter().map(|tab| tab.info()).collect()
    }

    fn ordered(&self) -> Vec<Arc<Tab>> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tabs.get(id).cloned())
            .collect()
    }

    /// Open a tab on `provider_id` with its default model.
    ///
    /// The tab is only added once its provider client is ready; on any error
    /// the registry is left unchanged.
    pub async fn create(&self, provider_id: &str, label: Option<&str>) -> Result<Arc<Tab>> {
        self.check_capacity()?;

        let label = label.map(|l| self.normalize_label(l)).transpose()?;
        let tab = Arc::new(Tab::new(
            Arc::clone(&self.factory),
            provider_id,
            label.as_deref(),
            &self.settings.tab_defaults,
        )?);
        tab.initialize(None).await?;

        {
            let mut state = self.state.lock();
            if state.tabs.len() >= self.settings.max_tabs {
                drop(state);
                tab.release();
                return Err(TabError::MaxTabs(self.settings.max_tabs));
            }
            state.insert(Arc::clone(&tab));
        }

        tracing::info!(tab_id = %tab.id(), provider = %tab.provider_id(), "Created new tab");
        self.observers.emit(&RegistryEvent::Created {
            tab_id: tab.id().to_string(),
        });

        Ok(tab)
    }

    /// Remove a tab and release its client.
    ///
    /// If it was active, the last remaining tab becomes active.
    pub fn close(&self, tab_id: &str) -> Result<()> {
        let (tab, active_change) = {
            let mut state = self.state.lock();
            let tab = state
                .tabs
                .remove(tab_id)
                .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;
            state.order.retain(|id| id != tab_id);
            state.renumber();

            let active_change = if state.active.as_deref() == Some(tab_id) {
                state.active = state.order.last().cloned();
                Some(state.active.clone())
            } else {
                None
            };
            (tab, active_change)
        };

        tab.release();
        tracing::info!(tab_id = %tab_id, "Closed tab");

        if let Some(current) = active_change {
            if let Some(next) = current.as_deref().and_then(|id| self.get(id).ok()) {
                next.touch();
            }
            self.observers.emit(&RegistryEvent::ActiveChanged {
                previous: Some(tab_id.to_string()),
                current,
            });
        }
        self.observers.emit(&RegistryEvent::Closed {
            tab_id: tab_id.to_string(),
        });

        Ok(())
    }

    /// Close every tab, in display order
    pub fn close_all(&self) {
        let (tabs, previous) = {
            let mut state = self.state.lock();
            let order = std::mem::take(&mut state.order);
            let mut tabs = std::mem::take(&mut state.tabs);
            let ordered: Vec<Arc<Tab>> = order.iter().filter_map(|id| tabs.remove(id)).collect();
            (ordered, state.active.take())
        };

        for tab in &tabs {
            tab.release();
        }
        tracing::info!(count = tabs.len(), "Closed all tabs");

        if previous.is_some() {
            self.observers.emit(&RegistryEvent::ActiveChanged {
                previous,
                current: None,
            });
        }
        for tab in tabs {
            self.observers.emit(&RegistryEvent::Closed {
                tab_id: tab.id().to_string(),
            });
        }
    }

    /// Move a tab to `new_index` in the display order
    pub fn reorder(&self, tab_id: &str, new_index: usize) -> Result<()> {
        let mut state = self.state.lock();
        let current = state
            .order
            .iter()
            .position(|id| id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;

        let len = state.order.len();
        if new_index >= len {
            return Err(TabError::InvalidArgument(format!(
                "index {new_index} is out of range for {len} tabs"
            )));
        }

        let id = state.order.remove(current);
        state.order.insert(new_index, id);
        state.renumber();

        tracing::debug!(tab_id = %tab_id, from = current, to = new_index, "Reordered tab");
        Ok(())
    }

    pub fn rename(&self, tab_id: &str, label: &str) -> Result<()> {
        let label = self.normalize_label(label)?;
        let tab = self.get(tab_id)?;
        tab.set_label(label);
        Ok(())
    }

    /// Make `tab_id` the active tab. No event when it already is.
    pub fn set_active(&self, tab_id: &str) -> Result<()> {
        let (tab, previous) = {
            let mut state = self.state.lock();
            let tab = state
                .tabs
                .get(tab_id)
                .cloned()
                .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;
            if state.active.as_deref() == Some(tab_id) {
                return Ok(());
            }
            let previous = state.active.replace(tab_id.to_string());
            (tab, previous)
        };

        tab.touch();
        tracing::debug!(tab_id = %tab_id, "Activated tab");
        self.observers.emit(&RegistryEvent::ActiveChanged {
            previous,
            current: Some(tab_id.to_string()),
        });
        Ok(())
    }

    /// Rebuild tabs from persisted snapshots, in ascending saved order.
    ///
    /// Tabs that fail to initialize are skipped. Returns how many were
    /// restored.
    pub async fn restore(&self, mut snapshots: Vec<TabSnapshot>) -> usize {
        snapshots.sort_by_key(|s| s.order);
        let mut restored = 0;

        for snapshot in snapshots {
            let tab_id = snapshot.tab_id.clone();
            {
                let state = self.state.lock();
                if state.tabs.len() >= self.settings.max_tabs {
                    tracing::warn!(
                        max_tabs = self.settings.max_tabs,
                        "Tab limit reached, remaining saved tabs not restored"
                    );
                    break;
                }
                if state.tabs.contains_key(&tab_id) {
                    tracing::warn!(tab_id = %tab_id, "Tab already open, skipping");
                    continue;
                }
            }

            let key_alias = snapshot.key_alias.clone();
            let tab = Arc::new(Tab::from_snapshot(
                Arc::clone(&self.factory),
                snapshot,
                &self.settings.tab_defaults,
            ));
            if let Err(e) = tab.initialize(key_alias.as_deref()).await {
                tracing::warn!(tab_id = %tab_id, error = %e, "Skipping tab that failed to restore");
                continue;
            }

            let inserted = {
                let mut state = self.state.lock();
                if state.tabs.len() >= self.settings.max_tabs || state.tabs.contains_key(&tab_id) {
                    false
                } else {
                    state.insert(Arc::clone(&tab));
                    true
                }
            };
            if !inserted {
                tab.release();
                continue;
            }

            self.observers.emit(&RegistryEvent::Created { tab_id });
            restored += 1;
        }

        tracing::info!(restored, "Restored tabs");
        restored
    }

    /// Snapshots of all tabs in display order
    pub fn export_states(&self) -> Vec<TabSnapshot> {
        self.ordered().iter().map(|tab| tab.export_state()).collect()
    }

    pub fn subscribe<F>(&self, kind: RegistryEventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(callback);
        self.observers.subscribe(kind, observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn check_capacity(&self) -> Result<()> {
        if self.tab_count() >= self.settings.max_tabs {
            return Err(TabError::MaxTabs(self.settings.max_tabs));
        }
        Ok(())
    }

    fn normalize_label(&self, label: &str) -> Result<String> {
        let label = label.trim();
        if label.is_empty() {
            return Err(TabError::InvalidArgument("label is blank".to_string()));
        }
        Ok(label.chars().take(self.settings.max_label_len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, KEYLESS, SCRIPTED};
    use futures_util::StreamExt;
    use parley_providers::TokenUsage;

    fn registry(max_tabs: usize) -> TabRegistry {
        let (factory, _log) = testing::factory(Some(TokenUsage::new(1, 1)));
        TabRegistry::with_settings(
            factory,
            RegistrySettings {
                max_tabs,
                ..RegistrySettings::default()
            },
        )
    }

    fn record(registry: &TabRegistry) -> Arc<Mutex<Vec<RegistryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            RegistryEventKind::Created,
            RegistryEventKind::Closed,
            RegistryEventKind::ActiveChanged,
        ] {
            let events = events.clone();
            registry.subscribe(kind, move |event| events.lock().push(event.clone()));
        }
        events
    }

    fn assert_consistent(registry: &TabRegistry) {
        let state = registry.state.lock();
        assert_eq!(state.order.len(), state.tabs.len());
        for (index, id) in state.order.iter().enumerate() {
            assert_eq!(state.tabs[id].order(), index);
        }
        if let Some(active) = &state.active {
            assert!(state.tabs.contains_key(active));
        }
    }

    #[tokio::test]
    async fn test_create_first_tab_becomes_active() {
        let registry = registry(10);
        let events = record(&registry);

        let a = registry.create(SCRIPTED, None).await.unwrap();
        let b = registry.create(SCRIPTED, Some("Second")).await.unwrap();

        assert_eq!(registry.active_tab_id().as_deref(), Some(a.id()));
        assert_eq!(registry.tab_count(), 2);
        assert_eq!(b.label(), "Second");
        assert_eq!(b.order(), 1);
        assert!(a.is_initialized());
        assert_eq!(
            *events.lock(),
            vec![
                RegistryEvent::Created { tab_id: a.id().to_string() },
                RegistryEvent::Created { tab_id: b.id().to_string() },
            ]
        );
        assert_consistent(&registry);
    }

    #[tokio::test]
    async fn test_capacity() {
        let registry = registry(1);
        let first = registry.create(SCRIPTED, None).await.unwrap();
        assert!(matches!(
            registry.create(SCRIPTED, None).await.err(),
            Some(TabError::MaxTabs(1))
        ));
        assert_eq!(registry.tab_count(), 1);
        assert_consistent(&registry);

        // Closing frees the slot again
        registry.close(first.id()).unwrap();
        let second = registry.create(SCRIPTED, None).await.unwrap();
        assert_ne!(second.id(), first.id());
        assert_eq!(registry.tab_count(), 1);
        assert_eq!(registry.active_tab_id().as_deref(), Some(second.id()));
        assert_consistent(&registry);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_registry_unchanged() {
        let registry = registry(10);
        let events = record(&registry);

        assert!(registry.create(KEYLESS, None).await.is_err());
        assert!(registry.create("", None).await.unwrap_err().is_invalid_argument());
        assert!(registry.create(SCRIPTED, Some("  ")).await.is_err());

        assert_eq!(registry.tab_count(), 0);
        assert!(registry.active_tab_id().is_none());
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_reassigns_active_to_last() {
        let registry = registry(10);
        let a = registry.create(SCRIPTED, None).await.unwrap();
        let b = registry.create(SCRIPTED, None).await.unwrap();
        let c = registry.create(SCRIPTED, None).await.unwrap();
        let events = record(&registry);

        registry.close(a.id()).unwrap();
        assert_eq!(registry.active_tab_id().as_deref(), Some(c.id()));
        assert_eq!(b.order(), 0);
        assert_eq!(c.order(), 1);
        assert!(!a.is_initialized());
        assert_eq!(
            *events.lock(),
            vec![
                RegistryEvent::ActiveChanged {
                    previous: Some(a.id().to_string()),
                    current: Some(c.id().to_string()),
                },
                RegistryEvent::Closed { tab_id: a.id().to_string() },
            ]
        );

        // Closing an inactive tab keeps the active one
        registry.close(b.id()).unwrap();
        assert_eq!(registry.active_tab_id().as_deref(), Some(c.id()));
        assert!(matches!(registry.close(b.id()), Err(TabError::NotFound(_))));

        registry.close(c.id()).unwrap();
        assert!(registry.active_tab_id().is_none());
        assert_consistent(&registry);
    }

    #[tokio::test]
    async fn test_close_cancels_streaming_tab() {
        let registry = registry(10);
        let tab = registry.create(SCRIPTED, None).await.unwrap();
        let mut stream = tab.send("hang on", None).await.unwrap();
        stream.next().await.unwrap().unwrap();

        registry.close(tab.id()).unwrap();
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert!(!tab.is_streaming());
    }

    #[tokio::test]
    async fn test_set_active_is_idempotent() {
        let registry = registry(10);
        let a = registry.create(SCRIPTED, None).await.unwrap();
        let b = registry.create(SCRIPTED, None).await.unwrap();
        let events = record(&registry);

        registry.set_active(a.id()).unwrap();
        assert!(events.lock().is_empty());

        let before = b.info().last_active_at;
        registry.set_active(b.id()).unwrap();
        registry.set_active(b.id()).unwrap();
        assert_eq!(events.lock().len(), 1);
        assert!(b.info().last_active_at >= before);
        assert_eq!(registry.active_tab().unwrap().id(), b.id());

        assert!(matches!(registry.set_active("missing"), Err(TabError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reorder() {
        let registry = registry(10);
        let a = registry.create(SCRIPTED, Some("a")).await.unwrap();
        registry.create(SCRIPTED, Some("b")).await.unwrap();
        registry.create(SCRIPTED, Some("c")).await.unwrap();

        registry.reorder(a.id(), 2).unwrap();
        let labels: Vec<String> = registry.tabs().into_iter().map(|t| t.label).collect();
        assert_eq!(labels, vec!["b", "c", "a"]);
        assert_eq!(a.order(), 2);

        assert!(matches!(registry.reorder(a.id(), 3), Err(TabError::InvalidArgument(_))));
        assert!(registry.reorder("missing", 0).unwrap_err().is_invalid_argument());
        assert_consistent(&registry);
    }

    #[tokio::test]
    async fn test_rename() {
        let registry = registry(10);
        let tab = registry.create(SCRIPTED, None).await.unwrap();

        registry.rename(tab.id(), "  Research  ").unwrap();
        assert_eq!(tab.label(), "Research");

        registry.rename(tab.id(), &"x".repeat(50)).unwrap();
        assert_eq!(tab.label().chars().count(), DEFAULT_MAX_LABEL_LEN);

        assert!(matches!(registry.rename(tab.id(), "   "), Err(TabError::InvalidArgument(_))));
        assert!(matches!(registry.rename("missing", "x"), Err(TabError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_export_and_restore() {
        let source = registry(10);
        let a = source.create(SCRIPTED, Some("first")).await.unwrap();
        source.create(SCRIPTED, Some("second")).await.unwrap();
        source.create(SCRIPTED, Some("third")).await.unwrap();
        let stream = a.send("hello", None).await.unwrap();
        stream.collect::<Vec<_>>().await;

        let mut states = source.export_states();
        assert_eq!(states.len(), 3);
        states.reverse();

        // A saved tab whose provider has no key cannot come back
        let mut broken = states[0].clone();
        broken.tab_id = "broken".to_string();
        broken.provider_id = KEYLESS.to_string();
        broken.order = 1;
        states.push(broken);

        let target = registry(10);
        assert_eq!(target.restore(states).await, 3);

        let labels: Vec<String> = target.tabs().into_iter().map(|t| t.label).collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
        assert_eq!(target.active_tab_id().as_deref(), Some(a.id()));
        assert_eq!(target.get(a.id()).unwrap().session().message_count(), 2);
        assert!(target.get("broken").is_err());
        assert_consistent(&target);
    }

    #[tokio::test]
    async fn test_restore_respects_capacity() {
        let source = registry(10);
        for _ in 0..3 {
            source.create(SCRIPTED, None).await.unwrap();
        }

        let target = registry(2);
        assert_eq!(target.restore(source.export_states()).await, 2);
        assert_eq!(target.tab_count(), 2);

        // A full registry takes nothing more
        assert_eq!(target.restore(source.export_states()).await, 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry(10);
        registry.create(SCRIPTED, None).await.unwrap();
        registry.create(SCRIPTED, None).await.unwrap();
        let events = record(&registry);

        registry.close_all();
        assert_eq!(registry.tab_count(), 0);
        assert!(registry.active_tab_id().is_none());

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RegistryEvent::ActiveChanged { current: None, .. }));
    }

    #[tokio::test]
    async fn test_observer_can_reenter_registry() {
        let registry = Arc::new(registry(10));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&registry);
        let counts = seen.clone();
        registry.subscribe(RegistryEventKind::Closed, move |_| {
            if let Some(registry) = weak.upgrade() {
                counts.lock().push(registry.tab_count());
            }
        });

        let tab = registry.create(SCRIPTED, None).await.unwrap();
        registry.create(SCRIPTED, None).await.unwrap();
        registry.close(tab.id()).unwrap();
        assert_eq!(*seen.lock(), vec![1]);
    }
}
