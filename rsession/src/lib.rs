//! Realtime connection sessions over the chat state store's fan-out channel.

mod error;
mod manager;

pub use error::{SessionError, SessionErrorKind};
pub use manager::{ClientEvent, PollSettings, SessionManager};
