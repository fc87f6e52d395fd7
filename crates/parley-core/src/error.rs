//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] parley_storage::StorageError),

    #[error("Tab error: {0}")]
    Tab(#[from] parley_tabs::TabError),

    #[error("Provider error: {0}")]
    Provider(#[from] parley_providers::ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
