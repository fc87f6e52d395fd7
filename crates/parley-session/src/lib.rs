//! Parley Session
//!
//! A Session is the ordered message log of one tab:
//! - Insertion order is conversation order, messages are never reordered
//! - The running token total always equals the sum of message token counts
//! - Context replayed to a backend is a detached snapshot, never a live view

mod error;
mod message;
mod session;

pub use error::SessionError;
pub use message::{Message, Role};
pub use session::{Session, SessionData};

pub type Result<T> = std::result::Result<T, SessionError>;
