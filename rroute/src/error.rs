//! Error types for provider resolution.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteErrorKind {
    /// No provider or credential is configured for the requested model.
    NotConfigured,
    /// The model identifier does not name a known provider.
    UnknownModel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteError {
    pub kind: RouteErrorKind,
    pub message: String,
}

impl RouteError {
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self {
            kind: RouteErrorKind::NotConfigured,
            message: message.into(),
        }
    }

    pub fn unknown_model(message: impl Into<String>) -> Self {
        Self {
            kind: RouteErrorKind::UnknownModel,
            message: message.into(),
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for RouteError {}
