//! Redis backend: durable conversation state plus pub/sub token fan-out.
//!
//! Conversations are stored as JSON blobs under a namespaced key, token
//! buffers use `APPEND`, live delivery uses `PUBLISH` on the conversation's
//! token channel, and the per-conversation generation lock is an advisory
//! `SET NX EX` key so an abandoned stream cannot wedge a conversation
//! forever.
//!
//! Channel payloads are stamped with the buffer offset they were appended
//! at (`<offset>:<encoded>`); a subscriber compares the offset against its
//! snapshot length, so snapshot plus live stream is exactly the generated
//! output regardless of how publishes interleave with the snapshot read.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use rcommon::{token_channel, BoxFuture, ConversationId, TokenPayload, UserId};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tracing::info;

use crate::error::StoreError;
use crate::store::{ChatStateStore, TokenSubscription};
use crate::types::{ConversationPatch, ConversationRecord, MessageRole, StoredMessage};

const KEY_PREFIX: &str = "rivulet";

/// Expiry on the advisory generation lock. A crashed relay releases the
/// conversation once this elapses.
const STREAM_LOCK_TTL_SECS: u64 = 300;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RedisStateStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStateStore {
    /// Connects and verifies the server with a PING. The caller decides how
    /// long to wait overall; this performs a single attempt.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|error| StoreError::unavailable(format!("invalid redis url: {error}")))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECTION_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);

        let mut manager = ConnectionManager::new_with_config(client.clone(), manager_config)
            .await
            .map_err(|error| {
                StoreError::unavailable(format!("redis connection failed: {error}"))
            })?;

        let response: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|error| StoreError::unavailable(format!("redis ping failed: {error}")))?;
        if response != "PONG" {
            return Err(StoreError::unavailable(format!(
                "unexpected ping response '{response}'"
            )));
        }

        info!("connected to redis state store");
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn load_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(conversation_key(conversation_id))
            .await
            .map_err(redis_error)?;

        match raw {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|error| {
                    StoreError::serialization(format!(
                        "failed to parse conversation record: {error}"
                    ))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn require_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationRecord, StoreError> {
        self.load_record(conversation_id).await?.ok_or_else(|| {
            StoreError::not_found(format!("conversation '{conversation_id}' not found"))
        })
    }

    async fn start_stream_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(buffer_key(conversation_id))
            .await
            .map_err(redis_error)?;

        let mut record = self.require_record(conversation_id).await?;
        record.streaming = true;
        self.save_record(conversation_id, &record).await
    }

    async fn save_record(
        &self,
        conversation_id: &ConversationId,
        record: &ConversationRecord,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|error| {
            StoreError::serialization(format!(
                "failed to serialize conversation record: {error}"
            ))
        })?;

        let mut conn = self.conn();
        conn.set::<_, _, ()>(conversation_key(conversation_id), json)
            .await
            .map_err(redis_error)
    }
}

fn redis_error(error: redis::RedisError) -> StoreError {
    StoreError::unavailable(format!("redis command failed: {error}"))
}

/// Stamp for payloads that never enter the buffer (post-completion audio);
/// they are always delivered.
const UNBUFFERED_OFFSET: u64 = u64::MAX;

fn stamp(offset: u64, encoded: &str) -> String {
    format!("{offset}:{encoded}")
}

fn unstamp(raw: &str) -> Option<(u64, &str)> {
    let (offset, payload) = raw.split_once(':')?;
    Some((offset.parse().ok()?, payload))
}

/// A payload whose buffer offset falls inside the snapshot is already in
/// the subscriber's hands and must not be delivered again.
fn delivers(offset: u64, snapshot_len: u64) -> bool {
    offset == UNBUFFERED_OFFSET || offset >= snapshot_len
}

fn conversation_key(conversation_id: &ConversationId) -> String {
    format!("{KEY_PREFIX}:conversation:{conversation_id}")
}

fn user_conversations_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:user:{user_id}:conversations")
}

fn buffer_key(conversation_id: &ConversationId) -> String {
    format!("{KEY_PREFIX}:buffer:{conversation_id}")
}

fn stream_lock_key(conversation_id: &ConversationId) -> String {
    format!("{KEY_PREFIX}:stream-lock:{conversation_id}")
}

fn credentials_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:credentials:{user_id}")
}

fn message_count_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:quota:{user_id}:messages")
}

fn voice_count_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:quota:{user_id}:voice")
}

impl ChatStateStore for RedisStateStore {
    fn init_conversation<'a>(
        &'a self,
        user_id: &'a UserId,
        conversation_id: &'a ConversationId,
        model: &'a str,
        title: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let record = ConversationRecord::new(user_id.as_str(), model, title);
            let json = serde_json::to_string(&record).map_err(|error| {
                StoreError::serialization(format!(
                    "failed to serialize conversation record: {error}"
                ))
            })?;

            let mut conn = self.conn();
            let inserted: bool = conn
                .set_nx(conversation_key(conversation_id), json)
                .await
                .map_err(redis_error)?;

            if inserted {
                conn.sadd::<_, _, ()>(
                    user_conversations_key(user_id),
                    conversation_id.as_str(),
                )
                .await
                .map_err(redis_error)?;
            }

            Ok(())
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<Option<ConversationRecord>, StoreError>> {
        Box::pin(self.load_record(conversation_id))
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut record = self.require_record(conversation_id).await?;
            patch.apply(&mut record);
            self.save_record(conversation_id, &record).await
        })
    }

    fn append_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message: StoredMessage,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut record = self.require_record(conversation_id).await?;
            record.messages.push(message);
            self.save_record(conversation_id, &record).await
        })
    }

    fn attach_audio<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        data_uri: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut record = self.require_record(conversation_id).await?;
            let message = record
                .messages
                .iter_mut()
                .rev()
                .find(|message| message.role == MessageRole::Assistant)
                .ok_or_else(|| StoreError::not_found("conversation has no assistant message"))?;
            message.audio = Some(data_uri.to_string());
            self.save_record(conversation_id, &record).await
        })
    }

    fn list_conversations<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<Vec<ConversationId>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let members: Vec<String> = conn
                .smembers(user_conversations_key(user_id))
                .await
                .map_err(redis_error)?;

            // Newest first; the set itself carries no order.
            let mut entries = Vec::with_capacity(members.len());
            for member in members {
                let conversation_id = ConversationId::new(member);
                if let Some(record) = self.load_record(&conversation_id).await? {
                    entries.push((record.created_at_secs, conversation_id));
                }
            }
            entries.sort_by(|a, b| (b.0, b.1.as_str()).cmp(&(a.0, a.1.as_str())));

            Ok(entries.into_iter().map(|(_, id)| id).collect())
        })
    }

    fn begin_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(stream_lock_key(conversation_id))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(STREAM_LOCK_TTL_SECS)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;

            if acquired.is_none() {
                return Ok(false);
            }

            // A failed start releases the lock instead of holding it for
            // the full TTL.
            if let Err(error) = self.start_stream_state(conversation_id).await {
                let _ = conn
                    .del::<_, ()>(stream_lock_key(conversation_id))
                    .await;
                return Err(error);
            }

            Ok(true)
        })
    }

    fn append_token<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let encoded = payload.encode();
            let mut conn = self.conn();

            // APPEND returns the buffer length afterward, which gives the
            // offset this payload starts at for free.
            let appended: u64 = conn
                .append(buffer_key(conversation_id), &encoded)
                .await
                .map_err(redis_error)?;
            let offset = appended - encoded.len() as u64;

            conn.publish::<_, _, ()>(token_channel(conversation_id), stamp(offset, &encoded))
                .await
                .map_err(|error| {
                    StoreError::fanout_unavailable(format!("redis publish failed: {error}"))
                })
        })
    }

    fn publish<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        payload: &'a TokenPayload,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.publish::<_, _, ()>(
                token_channel(conversation_id),
                stamp(UNBUFFERED_OFFSET, &payload.encode()),
            )
            .await
            .map_err(|error| {
                StoreError::fanout_unavailable(format!("redis publish failed: {error}"))
            })
        })
    }

    fn finish_streaming<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let content: Option<String> = conn
                .get(buffer_key(conversation_id))
                .await
                .map_err(redis_error)?;

            if let Some(mut record) = self.load_record(conversation_id).await? {
                record.streaming = false;
                self.save_record(conversation_id, &record).await?;
            }

            conn.del::<_, ()>(stream_lock_key(conversation_id))
                .await
                .map_err(redis_error)?;

            Ok(content.unwrap_or_default())
        })
    }

    fn read_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let content: Option<String> = conn
                .get(buffer_key(conversation_id))
                .await
                .map_err(redis_error)?;
            Ok(content.unwrap_or_default())
        })
    }

    fn clear_buffer<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.del::<_, ()>(buffer_key(conversation_id))
                .await
                .map_err(redis_error)
        })
    }

    fn set_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.hset::<_, _, _, ()>(credentials_key(user_id), provider, secret)
                .await
                .map_err(redis_error)
        })
    }

    fn get_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.hget(credentials_key(user_id), provider)
                .await
                .map_err(redis_error)
        })
    }

    fn delete_credential<'a>(
        &'a self,
        user_id: &'a UserId,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let removed: u64 = conn
                .hdel(credentials_key(user_id), provider)
                .await
                .map_err(redis_error)?;
            Ok(removed > 0)
        })
    }

    fn credentials_for<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<HashMap<String, String>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.hgetall(credentials_key(user_id))
                .await
                .map_err(redis_error)
        })
    }

    fn message_count<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let count: Option<u64> = conn
                .get(message_count_key(user_id))
                .await
                .map_err(redis_error)?;
            Ok(count.unwrap_or(0))
        })
    }

    fn increment_message_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.incr(message_count_key(user_id), 1u64)
                .await
                .map_err(redis_error)
        })
    }

    fn voice_count<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            let count: Option<u64> = conn
                .get(voice_count_key(user_id))
                .await
                .map_err(redis_error)?;
            Ok(count.unwrap_or(0))
        })
    }

    fn increment_voice_count<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn();
            conn.incr(voice_count_key(user_id), 1u64)
                .await
                .map_err(redis_error)
        })
    }

    fn supports_fanout(&self) -> bool {
        true
    }

    fn subscribe<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, Result<TokenSubscription, StoreError>> {
        Box::pin(async move {
            // Subscribe before reading the buffer so nothing published in
            // between is lost; the offset stamp decides, per payload, whether
            // the snapshot already contains it.
            let mut pubsub = self.client.get_async_pubsub().await.map_err(|error| {
                StoreError::fanout_unavailable(format!("redis subscribe failed: {error}"))
            })?;
            pubsub
                .subscribe(token_channel(conversation_id))
                .await
                .map_err(|error| {
                    StoreError::fanout_unavailable(format!("redis subscribe failed: {error}"))
                })?;

            let snapshot = self.read_buffer(conversation_id).await?;
            let snapshot_len = snapshot.len() as u64;

            let stream = pubsub
                .into_on_message()
                .filter_map(move |message| async move {
                    let raw = message.get_payload::<String>().ok()?;
                    let (offset, payload) = unstamp(&raw)?;
                    delivers(offset, snapshot_len).then(|| payload.to_string())
                })
                .boxed();

            Ok(TokenSubscription { snapshot, stream })
        })
    }
}
