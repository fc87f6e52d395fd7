//! Parley Tabs
//!
//! Tabs are independent chat contexts:
//! - Each owns its session, provider client and at most one in-flight request
//! - A new send supersedes the request before it
//! - The registry keeps display order and the active tab, and notifies observers

mod error;
mod events;
mod info;
mod registry;
mod state;
mod tab;

#[cfg(test)]
mod testing;

pub use error::TabError;
pub use events::{Observer, RegistryEvent, RegistryEventKind, SubscriptionId};
pub use info::{TabInfo, TabSnapshot};
pub use registry::{RegistrySettings, TabRegistry, DEFAULT_MAX_LABEL_LEN, DEFAULT_MAX_TABS};
pub use state::StreamState;
pub use tab::{Tab, TabDefaults};

pub type Result<T> = std::result::Result<T, TabError>;
