//! Runtime wiring helpers.
//!
//! `build_runtime` performs the one-shot store selection and assembles the
//! relay and session manager on top of whichever backend came up.

use std::sync::Arc;

use crate::{
    ChatStateStore, CompletionBackend, CredentialSet, HttpCompletionBackend, PollSettings,
    ProviderCatalog, QuotaEnforcer, QuotaLimits, SessionManager, SpeechSynthesizer, StoreConfig,
    StoreError, StreamRelay, UserId,
};

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub store: StoreConfig,
    pub shared_aggregator_key: Option<String>,
    pub quota: QuotaLimits,
    pub poll: PollSettings,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_shared_aggregator_key(mut self, key: impl Into<String>) -> Self {
        self.shared_aggregator_key = Some(key.into());
        self
    }

    pub fn with_quota(mut self, quota: QuotaLimits) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }
}

#[derive(Clone)]
pub struct RuntimeBundle {
    pub store: Arc<dyn ChatStateStore>,
    pub catalog: ProviderCatalog,
    pub relay: Arc<StreamRelay>,
    pub sessions: Arc<SessionManager>,
    pub shared_aggregator_key: Option<String>,
}

impl RuntimeBundle {
    /// The user's stored keys as a routing credential set.
    pub async fn credential_set_for(&self, user_id: &UserId) -> Result<CredentialSet, StoreError> {
        Ok(CredentialSet::from(
            self.store.credentials_for(user_id).await?,
        ))
    }
}

pub async fn build_runtime(config: RuntimeConfig) -> Result<RuntimeBundle, StoreError> {
    build_runtime_with(config, Arc::new(HttpCompletionBackend::new()), None).await
}

pub async fn build_runtime_with(
    config: RuntimeConfig,
    backend: Arc<dyn CompletionBackend>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
) -> Result<RuntimeBundle, StoreError> {
    let store = crate::connect_state_store(config.store).await?;
    let catalog = ProviderCatalog::builtin();

    let quota = QuotaEnforcer::new(Arc::clone(&store), config.quota);
    let mut relay = StreamRelay::new(Arc::clone(&store), backend, quota);
    if let Some(speech) = speech {
        relay = relay.with_speech_synthesizer(speech);
    }

    let sessions = Arc::new(SessionManager::new(Arc::clone(&store), config.poll));

    Ok(RuntimeBundle {
        store,
        catalog,
        relay: Arc::new(relay),
        sessions,
        shared_aggregator_key: config.shared_aggregator_key,
    })
}
