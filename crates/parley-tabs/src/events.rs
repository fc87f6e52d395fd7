//! Registry notifications
//!
//! Observers subscribe per event kind and are called in registration order,
//! always after the registry has released its own lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEventKind {
    Created,
    Closed,
    ActiveChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created {
        tab_id: String,
    },
    Closed {
        tab_id: String,
    },
    ActiveChanged {
        previous: Option<String>,
        current: Option<String>,
    },
}

impl RegistryEvent {
    pub fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::Created { .. } => RegistryEventKind::Created,
            RegistryEvent::Closed { .. } => RegistryEventKind::Closed,
            RegistryEvent::ActiveChanged { .. } => RegistryEventKind::ActiveChanged,
        }
    }
}

pub type Observer = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, RegistryEventKind, Observer)>>,
}

impl Observers {
    pub fn subscribe(&self, kind: RegistryEventKind, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, kind, observer));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    /// Callbacks run outside the observer lock, so they may subscribe or
    /// call back into the registry.
    pub fn emit(&self, event: &RegistryEvent) {
        let kind = event.kind();
        let targets: Vec<Observer> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, observer)| Arc::clone(observer))
            .collect();

        for observer in targets {
            observer(event);
        }
    }
}
