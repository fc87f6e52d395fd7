//! Parley Storage Layer
//!
//! SQLite persistence for tab state and settings. Tab lists are written
//! in a single transaction.

mod error;
mod migrations;
mod store;

pub use error::StorageError;
pub use store::StateStore;

pub type Result<T> = std::result::Result<T, StorageError>;
