//! Chat state store contract and startup backend selection.
//!
//! All higher components depend on [`ChatStateStore`] alone; the choice
//! between the networked backend and the local fallback is made exactly once
//! at process startup by [`connect_state_store`] and never revisited.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use rcommon::{BoxFuture, ConversationId, TokenPayload, UserId};
use tracing::{info, warn};

use crate::backends::local::LocalStateStore;
use crate::backends::redis::RedisStateStore;
use crate::error::StoreError;
use crate::types::{ConversationPatch, ConversationRecord, StoredMessage};

pub type BoxedPayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A live fan-out subscription for one conversation.
///
/// `snapshot` is the buffer content at subscribe time; the union of the
/// snapshot and the payloads subsequently yielded by `stream` equals the
/// full generated output, with no token duplicated or dropped.
pub struct TokenSubscription {
    pub snapshot: String,
    pub stream: BoxedPayloadStream,
}

impl std::fmt::Debug for TokenSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSubscription")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

pub trait ChatStateStore: Send + Sync {
    fn init_conversation<'a>(
        &'a self,
        user_id: &'a UserId,
        conversation_id: &'a ConversationId,
        model: &'a str,
        title: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<Option<ConversationRecord>, StoreError>>;

    fn update_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn append_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message: StoredMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Sets the audio reference on the most recent assistant message.
    fn attach_audio<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        data_uri: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn list_conversations<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<Vec<ConversationId>, StoreError>>;

    /// Advisory per-conversation generation lock. Returns `false` when a
    /// generation is already in flight; on success the streaming flag is set
    /// and the buffer is reset to empty.
    fn begin_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Concatenates the encoded payload onto the buffer and publishes it on
    /// the conversation's token channel.
    fn append_token<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Publishes without buffering (used for post-completion audio).
    fn publish<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Returns the accumulated buffer, clears the streaming flag, and
    /// releases the generation lock. The caller clears the buffer afterward.
    fn finish_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>>;

    fn read_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>>;

    fn clear_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn set_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn get_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    fn delete_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn credentials_for<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<HashMap<String, String>, StoreError>>;

    fn message_count<'a>(&'a self, user_id: &'a UserId)
    -> BoxFuture<'a, Result<u64, StoreError>>;

    fn increment_message_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn voice_count<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn increment_voice_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Whether live cross-process fan-out is available. The session manager
    /// falls back to polling when this is `false`.
    fn supports_fanout(&self) -> bool;

    fn subscribe<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<TokenSubscription, StoreError>>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub connect_timeout: Duration,
    pub snapshot_path: PathBuf,
    pub snapshot_debounce: Duration,
}

impl StoreConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_SNAPSHOT_DEBOUNCE: Duration = Duration::from_secs(2);

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = path.into();
        self
    }

    pub fn with_snapshot_debounce(mut self, debounce: Duration) -> Self {
        self.snapshot_debounce = debounce;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            snapshot_path: PathBuf::from("rivulet-state.json"),
            snapshot_debounce: Self::DEFAULT_SNAPSHOT_DEBOUNCE,
        }
    }
}

/// One-shot backend selection. Tries the networked backend within the
/// configured timeout; on any failure the process runs on the local
/// fallback for its entire lifetime. There is no mid-run recovery back to
/// networked mode.
pub async fn connect_state_store(
    config: StoreConfig,
) -> Result<Arc<dyn ChatStateStore>, StoreError> {
    if let Some(url) = &config.redis_url {
        match tokio::time::timeout(config.connect_timeout, RedisStateStore::connect(url)).await {
            Ok(Ok(store)) => {
                info!(url = %url, "connected to networked state store");
                return Ok(Arc::new(store));
            }
            Ok(Err(error)) => {
                warn!(%error, "networked state store unreachable, entering fallback mode");
            }
            Err(_) => {
                warn!(
                    timeout_secs = config.connect_timeout.as_secs(),
                    "networked state store connection timed out, entering fallback mode"
                );
            }
        }
    }

    let local = LocalStateStore::open(&config.snapshot_path)?
        .with_debounce(config.snapshot_debounce);
    Ok(Arc::new(local))
}
