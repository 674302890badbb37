//! Error types for connection session management.

use std::error::Error;
use std::fmt;

use rstore::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The state store failed underneath the session manager.
    Store,
    /// The caller does not own the conversation (or it does not exist).
    Unauthorized,
    /// A bounded wait elapsed without the expected state change.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn store(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::Store,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::Unauthorized,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::Timeout,
            message: message.into(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        Self::store(error.to_string())
    }
}
