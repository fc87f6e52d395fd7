//! Parley Core
//!
//! Wires the tab registry to persistent storage and owns configuration
//! and logging setup.

mod config;
mod error;
mod workspace;

pub use config::Config;
pub use error::CoreError;
pub use workspace::Workspace;

pub use parley_providers::{
    ChunkStream, LlmProvider, MemorySecretStore, ProviderConfig, ProviderError, ProviderFactory,
    ProviderInfo, SecretStore, StreamChunk,
};
pub use parley_session::{Message, Role, Session};
pub use parley_storage::{StateStore, StorageError};
pub use parley_tabs::{
    RegistryEvent, RegistryEventKind, StreamState, Tab, TabError, TabInfo, TabRegistry,
    TabSnapshot,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
