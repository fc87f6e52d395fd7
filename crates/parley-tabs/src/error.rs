//! Tab error types

use parley_providers::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabError {
    #[error("Maximum number of tabs ({0}) reached")]
    MaxTabs(usize),

    #[error("Tab not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tab {0} has no provider client, initialize it first")]
    NotInitialized(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl TabError {
    /// Unknown ids and malformed input both count as caller mistakes
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            TabError::InvalidArgument(_)
                | TabError::NotFound(_)
                | TabError::Provider(ProviderError::InvalidArgument(_))
        )
    }
}
