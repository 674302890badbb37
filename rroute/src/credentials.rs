//! Per-user BYOK credential set.

use std::collections::HashMap;

/// The provider keys one user has supplied. A user key fully overrides any
/// shared key for that provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    keys: HashMap<String, String>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(provider.into(), key.into());
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.keys.contains_key(provider)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<HashMap<String, String>> for CredentialSet {
    fn from(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }
}
