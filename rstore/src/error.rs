//! Store-layer errors for state, buffer, and fan-out operations.

use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Unavailable,
    FanoutUnavailable,
    Serialization,
    PersistenceWrite,
    NotFound,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn fanout_unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::FanoutUnavailable, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Serialization, message)
    }

    pub fn persistence_write(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PersistenceWrite, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for StoreError {}
