//! Error types for the streaming relay.

use std::error::Error;
use std::fmt;

use rstore::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Trial quota exhausted before dispatch.
    Quota,
    /// No usable credential for the resolved provider.
    Credential,
    /// Upstream returned a non-success status or the transport failed.
    Upstream,
    /// An incremental unit could not be parsed.
    MalformedChunk,
    /// The state store failed underneath the relay.
    Store,
    /// A generation is already in flight for this conversation.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
}

impl RelayError {
    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Quota,
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Credential,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Upstream,
            message: message.into(),
        }
    }

    pub fn malformed_chunk(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::MalformedChunk,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Store,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Busy,
            message: message.into(),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for RelayError {}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        Self::store(error.to_string())
    }
}
