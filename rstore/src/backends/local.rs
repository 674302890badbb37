//! Local fallback backend: in-process maps with a debounced disk snapshot.
//!
//! Used for the lifetime of the process when the networked backend is
//! unreachable at startup. Credentials, counters, and conversations survive
//! a restart through the snapshot file; stream buffers and streaming flags
//! are transient and reset on load. There is no cross-process pub/sub, so
//! [`ChatStateStore::subscribe`] always fails and `supports_fanout` is
//! `false`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rcommon::{BoxFuture, ConversationId, TokenPayload, UserId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::store::{ChatStateStore, StoreConfig, TokenSubscription};
use crate::types::{ConversationPatch, ConversationRecord, MessageRole, StoredMessage};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    conversations: HashMap<String, ConversationRecord>,
    credentials: HashMap<String, HashMap<String, String>>,
    message_counts: HashMap<String, u64>,
    voice_counts: HashMap<String, u64>,
    #[serde(skip)]
    buffers: HashMap<String, String>,
}

#[derive(Debug)]
pub struct LocalStateStore {
    path: PathBuf,
    debounce: Duration,
    state: Arc<Mutex<LocalState>>,
    flush_scheduled: Arc<AtomicBool>,
}

impl LocalStateStore {
    /// Opens the store, reloading any previous snapshot at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = if path.exists() {
            let bytes = fs::read(&path).map_err(|error| {
                StoreError::persistence_write(format!("failed to read snapshot file: {error}"))
            })?;
            serde_json::from_slice::<LocalState>(&bytes).map_err(|error| {
                StoreError::serialization(format!("failed to parse snapshot file: {error}"))
            })?
        } else {
            LocalState::default()
        };

        // Streaming flags never survive a restart; any generation that was
        // in flight when the process died is over.
        for record in state.conversations.values_mut() {
            record.streaming = false;
        }

        Ok(Self {
            path,
            debounce: StoreConfig::DEFAULT_SNAPSHOT_DEBOUNCE,
            state: Arc::new(Mutex::new(state)),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Writes the snapshot immediately, bypassing the debounce window.
    pub fn flush(&self) -> Result<(), StoreError> {
        let state = self.lock()?;
        write_snapshot(&self.path, &state)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::other("local state store lock poisoned"))
    }

    /// Schedules a debounced snapshot write. Coalesces bursts of mutations
    /// into a single disk write; a failed write is logged and the in-memory
    /// state remains authoritative.
    fn mark_dirty(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let path = self.path.clone();
        let state = Arc::clone(&self.state);
        let flush_scheduled = Arc::clone(&self.flush_scheduled);
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            flush_scheduled.store(false, Ordering::SeqCst);

            let result = match state.lock() {
                Ok(state) => write_snapshot(&path, &state),
                Err(_) => Err(StoreError::other("local state store lock poisoned")),
            };

            if let Err(error) = result {
                warn!(%error, "snapshot write failed, in-memory state remains authoritative");
            }
        });
    }
}

fn write_snapshot(path: &Path, state: &LocalState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(|error| {
        StoreError::serialization(format!("failed to serialize snapshot: {error}"))
    })?;

    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| {
                StoreError::persistence_write(format!(
                    "failed to create snapshot directory: {error}"
                ))
            })?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|error| {
        StoreError::persistence_write(format!("failed to write temporary snapshot: {error}"))
    })?;

    fs::rename(&tmp, path).map_err(|error| {
        StoreError::persistence_write(format!("failed to finalize snapshot: {error}"))
    })
}

impl ChatStateStore for LocalStateStore {
    fn init_conversation<'a>(
        &'a self,
        user_id: &'a UserId,
        conversation_id: &'a ConversationId,
        model: &'a str,
        title: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                if state.conversations.contains_key(conversation_id.as_str()) {
                    return Ok(());
                }

                state.conversations.insert(
                    conversation_id.as_str().to_string(),
                    ConversationRecord::new(user_id.as_str(), model, title),
                );
            }

            self.mark_dirty();
            Ok(())
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<Option<ConversationRecord>, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state.conversations.get(conversation_id.as_str()).cloned())
        })
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                let record = state
                    .conversations
                    .get_mut(conversation_id.as_str())
                    .ok_or_else(|| {
                        StoreError::not_found(format!(
                            "conversation '{conversation_id}' not found"
                        ))
                    })?;
                patch.apply(record);
            }

            self.mark_dirty();
            Ok(())
        })
    }

    fn append_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message: StoredMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                let record = state
                    .conversations
                    .get_mut(conversation_id.as_str())
                    .ok_or_else(|| {
                        StoreError::not_found(format!(
                            "conversation '{conversation_id}' not found"
                        ))
                    })?;
                record.messages.push(message);
            }

            self.mark_dirty();
            Ok(())
        })
    }

    fn attach_audio<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        data_uri: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                let record = state
                    .conversations
                    .get_mut(conversation_id.as_str())
                    .ok_or_else(|| {
                        StoreError::not_found(format!(
                            "conversation '{conversation_id}' not found"
                        ))
                    })?;

                let message = record
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|message| message.role == MessageRole::Assistant)
                    .ok_or_else(|| {
                        StoreError::not_found("conversation has no assistant message")
                    })?;
                message.audio = Some(data_uri.to_string());
            }

            self.mark_dirty();
            Ok(())
        })
    }

    fn list_conversations<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<Vec<ConversationId>, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            let mut entries: Vec<(&String, &ConversationRecord)> = state
                .conversations
                .iter()
                .filter(|(_, record)| record.user_id == user_id.as_str())
                .collect();
            entries.sort_by(|a, b| (b.1.created_at_secs, b.0).cmp(&(a.1.created_at_secs, a.0)));

            Ok(entries
                .into_iter()
                .map(|(id, _)| ConversationId::new(id.clone()))
                .collect())
        })
    }

    fn begin_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            let record = state
                .conversations
                .get_mut(conversation_id.as_str())
                .ok_or_else(|| {
                    StoreError::not_found(format!("conversation '{conversation_id}' not found"))
                })?;

            if record.streaming {
                return Ok(false);
            }

            record.streaming = true;
            state
                .buffers
                .insert(conversation_id.as_str().to_string(), String::new());
            Ok(true)
        })
    }

    fn append_token<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            state
                .buffers
                .entry(conversation_id.as_str().to_string())
                .or_default()
                .push_str(&payload.encode());
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        _conversation_id: &'a ConversationId,
        _payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        // No pub/sub in fallback mode; pollers pick the content up from the
        // buffer or the persisted record instead.
        Box::pin(async move { Ok(()) })
    }

    fn finish_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let content = {
                let mut state = self.lock()?;
                if let Some(record) = state.conversations.get_mut(conversation_id.as_str()) {
                    record.streaming = false;
                }

                state
                    .buffers
                    .get(conversation_id.as_str())
                    .cloned()
                    .unwrap_or_default()
            };

            self.mark_dirty();
            Ok(content)
        })
    }

    fn read_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .buffers
                .get(conversation_id.as_str())
                .cloned()
                .unwrap_or_default())
        })
    }

    fn clear_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            state.buffers.remove(conversation_id.as_str());
            Ok(())
        })
    }

    fn set_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                state
                    .credentials
                    .entry(user_id.as_str().to_string())
                    .or_default()
                    .insert(provider.to_string(), secret.to_string());
            }

            self.mark_dirty();
            Ok(())
        })
    }

    fn get_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .credentials
                .get(user_id.as_str())
                .and_then(|entries| entries.get(provider))
                .cloned())
        })
    }

    fn delete_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let removed = {
                let mut state = self.lock()?;
                state
                    .credentials
                    .get_mut(user_id.as_str())
                    .map(|entries| entries.remove(provider).is_some())
                    .unwrap_or(false)
            };

            if removed {
                self.mark_dirty();
            }

            Ok(removed)
        })
    }

    fn credentials_for<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<HashMap<String, String>, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .credentials
                .get(user_id.as_str())
                .cloned()
                .unwrap_or_default())
        })
    }

    fn message_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .message_counts
                .get(user_id.as_str())
                .copied()
                .unwrap_or(0))
        })
    }

    fn increment_message_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let count = {
                let mut state = self.lock()?;
                let count = state
                    .message_counts
                    .entry(user_id.as_str().to_string())
                    .or_insert(0);
                *count += 1;
                *count
            };

            self.mark_dirty();
            Ok(count)
        })
    }

    fn voice_count<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state
                .voice_counts
                .get(user_id.as_str())
                .copied()
                .unwrap_or(0))
        })
    }

    fn increment_voice_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let count = {
                let mut state = self.lock()?;
                let count = state
                    .voice_counts
                    .entry(user_id.as_str().to_string())
                    .or_insert(0);
                *count += 1;
                *count
            };

            self.mark_dirty();
            Ok(count)
        })
    }

    fn supports_fanout(&self) -> bool {
        false
    }

    fn subscribe<'a>(
        &'a self,
        _conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<TokenSubscription, StoreError>> {
        Box::pin(async move {
            Err(StoreError::fanout_unavailable(
                "local fallback store has no pub/sub channel",
            ))
        })
    }
}
