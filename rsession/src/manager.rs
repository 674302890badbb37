//! Per-connection conversation subscriptions.
//!
//! Each realtime connection holds at most one conversation subscription.
//! Joining spawns a forwarding task that decodes the sentinel-tagged
//! payloads into typed [`ClientEvent`]s; re-joining replaces the prior
//! subscription, and disconnect tears everything down. When the active
//! store has no fan-out channel, a joining client gets a bounded polling
//! loop instead of a live stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use rcommon::{ConnectionId, ConversationId, TokenPayload, UserId};
use rstore::{BoxedPayloadStream, ChatStateStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Typed events delivered to one realtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// One answer fragment.
    Token(String),
    /// One reasoning fragment.
    Reasoning(String),
    /// A synthesized-audio data URI for the finished answer.
    Audio(String),
    /// Everything buffered so far, sent once when joining mid-generation.
    /// Carries the raw sentinel-encoded buffer.
    StreamProgress(String),
    /// The full generated content, delivered once by the polling fallback
    /// when the generation it was watching completes.
    StreamResume(String),
    /// The polling fallback gave up waiting for the generation to finish.
    StreamTimeout,
    /// The live payload stream closed.
    StreamEnded,
}

/// Polling fallback tuning for stores without fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

struct ActiveSubscription {
    conversation_id: ConversationId,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    store: Arc<dyn ChatStateStore>,
    poll: PollSettings,
    subscriptions: Mutex<HashMap<ConnectionId, ActiveSubscription>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ChatStateStore>, poll: PollSettings) -> Self {
        Self {
            store,
            poll,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes a connection to a conversation's token channel. Returns
    /// the receiving end of the connection's event stream; any prior
    /// subscription held by the same connection is replaced.
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<mpsc::Receiver<ClientEvent>, SessionError> {
        let authorized = self
            .store
            .get_conversation(conversation_id)
            .await?
            .is_some_and(|record| record.user_id == user_id.as_str());
        if !authorized {
            return Err(SessionError::unauthorized(format!(
                "conversation '{conversation_id}' is not available to this user"
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // The mid-stream decision must come from state read after the
        // subscription (or buffer) exists: a generation that starts during
        // the ownership read already put its head tokens in the snapshot.
        let task = if self.store.supports_fanout() {
            let subscription = self.store.subscribe(conversation_id).await?;
            if self.streaming_now(conversation_id).await? || !subscription.snapshot.is_empty() {
                let _ = tx
                    .send(ClientEvent::StreamProgress(subscription.snapshot))
                    .await;
            }
            tokio::spawn(forward_live(subscription.stream, tx))
        } else {
            // Fallback store: no live channel. Show what is buffered, then
            // watch the streaming flag for the resume delivery.
            let buffer = self.store.read_buffer(conversation_id).await?;
            if self.streaming_now(conversation_id).await? {
                let _ = tx.send(ClientEvent::StreamProgress(buffer)).await;
                tokio::spawn(poll_for_completion(
                    Arc::clone(&self.store),
                    conversation_id.clone(),
                    self.poll,
                    tx,
                ))
            } else {
                tokio::spawn(async move {
                    let _ = tx.send(ClientEvent::StreamEnded).await;
                })
            }
        };

        let replaced = self.lock()?.insert(
            connection_id.clone(),
            ActiveSubscription {
                conversation_id: conversation_id.clone(),
                task,
            },
        );
        if let Some(prior) = replaced {
            debug!(%connection_id, conversation = %prior.conversation_id, "replacing subscription");
            prior.task.abort();
        }

        Ok(rx)
    }

    /// Drops the connection's subscription, if any.
    pub fn leave(&self, connection_id: &ConnectionId) -> Result<(), SessionError> {
        if let Some(subscription) = self.lock()?.remove(connection_id) {
            debug!(%connection_id, conversation = %subscription.conversation_id, "subscription torn down");
            subscription.task.abort();
        }
        Ok(())
    }

    /// The connection is gone; release everything it held.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), SessionError> {
        self.leave(connection_id)
    }

    pub fn subscribed_conversation(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ConversationId>, SessionError> {
        Ok(self
            .lock()?
            .get(connection_id)
            .map(|subscription| subscription.conversation_id.clone()))
    }

    pub fn active_subscriptions(&self) -> Result<usize, SessionError> {
        Ok(self.lock()?.len())
    }

    async fn streaming_now(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<bool, SessionError> {
        Ok(self
            .store
            .get_conversation(conversation_id)
            .await?
            .map(|record| record.streaming)
            .unwrap_or(false))
    }

    fn lock(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<ConnectionId, ActiveSubscription>>, SessionError> {
        self.subscriptions
            .lock()
            .map_err(|_| SessionError::store("session registry lock poisoned"))
    }
}

async fn forward_live(mut stream: BoxedPayloadStream, tx: mpsc::Sender<ClientEvent>) {
    while let Some(raw) = stream.next().await {
        let event = match TokenPayload::decode(&raw) {
            TokenPayload::Answer(text) => ClientEvent::Token(text),
            TokenPayload::Reasoning(text) => ClientEvent::Reasoning(text),
            TokenPayload::Audio(uri) => ClientEvent::Audio(uri),
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    let _ = tx.send(ClientEvent::StreamEnded).await;
}

async fn poll_for_completion(
    store: Arc<dyn ChatStateStore>,
    conversation_id: ConversationId,
    settings: PollSettings,
    tx: mpsc::Sender<ClientEvent>,
) {
    for _ in 0..settings.max_attempts {
        tokio::time::sleep(settings.interval).await;

        let record = match store.get_conversation(&conversation_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(error) => {
                warn!(%conversation_id, %error, "polling fallback store read failed");
                return;
            }
        };

        if !record.streaming {
            // Prefer the still-buffered content; if the relay already
            // cleared it, the persisted message is authoritative.
            let buffered = match store.read_buffer(&conversation_id).await {
                Ok(buffer) => buffer,
                Err(error) => {
                    warn!(%conversation_id, %error, "polling fallback buffer read failed");
                    String::new()
                }
            };
            let content = if buffered.is_empty() {
                record
                    .last_assistant_message()
                    .map(|message| message.content.clone())
                    .unwrap_or_default()
            } else {
                buffered
            };

            let _ = tx.send(ClientEvent::StreamResume(content)).await;
            let _ = tx.send(ClientEvent::StreamEnded).await;
            return;
        }
    }

    let _ = tx.send(ClientEvent::StreamTimeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use rcommon::BoxFuture;
    use rstore::{
        ConversationPatch, ConversationRecord, MessageRole, StoreError, StoredMessage,
        TokenSubscription,
    };
    use tokio::sync::broadcast;

    /// In-process stand-in for a fan-out capable store. Snapshot and
    /// subscription are taken under one lock, so the resume property is
    /// exact: snapshot + live payloads always equals the finished buffer.
    struct FanoutStore {
        state: Mutex<FanoutState>,
        channel: broadcast::Sender<String>,
        read_delay: Duration,
        fanout: bool,
    }

    struct FanoutState {
        record: ConversationRecord,
        buffer: String,
    }

    impl FanoutStore {
        fn new(record: ConversationRecord) -> Self {
            let (channel, _) = broadcast::channel(256);
            Self {
                state: Mutex::new(FanoutState {
                    record,
                    buffer: String::new(),
                }),
                channel,
                read_delay: Duration::ZERO,
                fanout: true,
            }
        }

        /// Slows record reads down so state can change underneath a join.
        fn with_read_delay(mut self, delay: Duration) -> Self {
            self.read_delay = delay;
            self
        }

        fn without_fanout(mut self) -> Self {
            self.fanout = false;
            self
        }
    }

    impl ChatStateStore for FanoutStore {
        fn init_conversation<'a>(
            &'a self,
            _user_id: &'a UserId,
            _conversation_id: &'a ConversationId,
            _model: &'a str,
            _title: &'a str,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn get_conversation<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<Option<ConversationRecord>, StoreError>> {
            Box::pin(async move {
                tokio::time::sleep(self.read_delay).await;
                let state = self.state.lock().expect("lock");
                Ok(Some(state.record.clone()))
            })
        }

        fn update_conversation<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            _patch: ConversationPatch,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn append_message<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            message: StoredMessage,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async move {
                self.state.lock().expect("lock").record.messages.push(message);
                Ok(())
            })
        }

        fn attach_audio<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            _data_uri: &'a str,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn list_conversations<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<Vec<ConversationId>, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn begin_streaming<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<bool, StoreError>> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                if state.record.streaming {
                    return Ok(false);
                }
                state.record.streaming = true;
                state.buffer.clear();
                Ok(true)
            })
        }

        fn append_token<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            payload: &'a TokenPayload,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async move {
                let encoded = payload.encode();
                let mut state = self.state.lock().expect("lock");
                state.buffer.push_str(&encoded);
                let _ = self.channel.send(encoded);
                Ok(())
            })
        }

        fn publish<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
            payload: &'a TokenPayload,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async move {
                let _ = self.channel.send(payload.encode());
                Ok(())
            })
        }

        fn finish_streaming<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<String, StoreError>> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                state.record.streaming = false;
                Ok(state.buffer.clone())
            })
        }

        fn read_buffer<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<String, StoreError>> {
            Box::pin(async move { Ok(self.state.lock().expect("lock").buffer.clone()) })
        }

        fn clear_buffer<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async move {
                self.state.lock().expect("lock").buffer.clear();
                Ok(())
            })
        }

        fn set_credential<'a>(
            &'a self,
            _user_id: &'a UserId,
            _provider: &'a str,
            _secret: &'a str,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn get_credential<'a>(
            &'a self,
            _user_id: &'a UserId,
            _provider: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn delete_credential<'a>(
            &'a self,
            _user_id: &'a UserId,
            _provider: &'a str,
        ) -> BoxFuture<'a, Result<bool, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn credentials_for<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<StdHashMap<String, String>, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn message_count<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<u64, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn increment_message_count<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<u64, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn voice_count<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<u64, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn increment_voice_count<'a>(
            &'a self,
            _user_id: &'a UserId,
        ) -> BoxFuture<'a, Result<u64, StoreError>> {
            unimplemented!("not used in these tests")
        }

        fn supports_fanout(&self) -> bool {
            self.fanout
        }

        fn subscribe<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, Result<TokenSubscription, StoreError>> {
            Box::pin(async move {
                let (snapshot, rx) = {
                    let state = self.state.lock().expect("lock");
                    (state.buffer.clone(), self.channel.subscribe())
                };
                let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                    match rx.recv().await {
                        Ok(payload) => Some((payload, rx)),
                        Err(_) => None,
                    }
                })
                .boxed();
                Ok(TokenSubscription { snapshot, stream })
            })
        }
    }

    fn record(user: &str) -> ConversationRecord {
        ConversationRecord::new(user, "openrouter/openai/gpt-4o-mini", "New chat")
    }

    async fn collect_until_ended(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let ended = event == ClientEvent::StreamEnded;
            events.push(event);
            if ended {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn joining_mid_stream_resumes_without_loss_or_duplication() {
        let store = Arc::new(FanoutStore::new(record("u1")));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );
        let conversation = ConversationId::new("c1");
        let user = UserId::new("u1");
        let connection = ConnectionId::new("conn-1");

        assert!(store.begin_streaming(&conversation).await.expect("begin"));
        store
            .append_token(&conversation, &TokenPayload::Answer("Hel".to_string()))
            .await
            .expect("append");

        let mut rx = manager.join(&connection, &user, &conversation).await.expect("join");

        store
            .append_token(&conversation, &TokenPayload::Answer("lo ".to_string()))
            .await
            .expect("append");
        store
            .append_token(&conversation, &TokenPayload::Answer("world".to_string()))
            .await
            .expect("append");
        let finished = store.finish_streaming(&conversation).await.expect("finish");

        let progress = rx.recv().await.expect("progress event");
        let ClientEvent::StreamProgress(snapshot) = progress else {
            panic!("expected the buffer snapshot first, got {progress:?}");
        };

        let mut delivered = snapshot;
        while delivered != finished {
            match rx.recv().await.expect("live event") {
                ClientEvent::Token(text) => delivered.push_str(&text),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(delivered, finished);
    }

    #[tokio::test]
    async fn join_racing_a_stream_start_does_not_drop_the_head_tokens() {
        // The generation begins while the join is still reading the record
        // for the ownership check; its first tokens land in the snapshot
        // and must still reach the client.
        let store = Arc::new(
            FanoutStore::new(record("u1")).with_read_delay(Duration::from_millis(50)),
        );
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );
        let conversation = ConversationId::new("c1");

        let producer = {
            let store = Arc::clone(&store);
            let conversation = conversation.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(store.begin_streaming(&conversation).await.expect("begin"));
                store
                    .append_token(&conversation, &TokenPayload::Answer("HEAD ".to_string()))
                    .await
                    .expect("append head");
            })
        };

        let mut rx = manager
            .join(&ConnectionId::new("conn-1"), &UserId::new("u1"), &conversation)
            .await
            .expect("join");
        producer.await.expect("producer");

        store
            .append_token(&conversation, &TokenPayload::Answer("tail".to_string()))
            .await
            .expect("append tail");
        let finished = store.finish_streaming(&conversation).await.expect("finish");
        assert_eq!(finished, "HEAD tail");

        let progress = rx.recv().await.expect("progress event");
        let ClientEvent::StreamProgress(snapshot) = progress else {
            panic!("expected the buffer snapshot first, got {progress:?}");
        };

        let mut delivered = snapshot;
        while delivered != finished {
            match rx.recv().await.expect("live event") {
                ClientEvent::Token(text) => delivered.push_str(&text),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(delivered, "HEAD tail");
    }

    #[tokio::test]
    async fn fallback_join_racing_a_stream_start_still_polls_to_completion() {
        let store = Arc::new(
            FanoutStore::new(record("u1"))
                .with_read_delay(Duration::from_millis(50))
                .without_fanout(),
        );
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(50),
        );
        let conversation = ConversationId::new("c1");

        let producer = {
            let store = Arc::clone(&store);
            let conversation = conversation.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(store.begin_streaming(&conversation).await.expect("begin"));
                store
                    .append_token(
                        &conversation,
                        &TokenPayload::Answer("full answer".to_string()),
                    )
                    .await
                    .expect("append");
            })
        };

        let mut rx = manager
            .join(&ConnectionId::new("conn-1"), &UserId::new("u1"), &conversation)
            .await
            .expect("join");
        producer.await.expect("producer");
        store.finish_streaming(&conversation).await.expect("finish");

        // A join that preceded the streaming flag must not end immediately;
        // it watches the flag and resumes with the generated content.
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::StreamProgress("full answer".to_string()))
        );
        let events = collect_until_ended(&mut rx).await;
        assert_eq!(
            events,
            vec![
                ClientEvent::StreamResume("full answer".to_string()),
                ClientEvent::StreamEnded,
            ]
        );
    }

    #[tokio::test]
    async fn sentinel_prefixes_become_typed_events() {
        let store = Arc::new(FanoutStore::new(record("u1")));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );
        let conversation = ConversationId::new("c1");
        let connection = ConnectionId::new("conn-1");

        let mut rx = manager
            .join(&connection, &UserId::new("u1"), &conversation)
            .await
            .expect("join");

        store
            .append_token(&conversation, &TokenPayload::Reasoning("why".to_string()))
            .await
            .expect("append");
        store
            .append_token(&conversation, &TokenPayload::Answer("because".to_string()))
            .await
            .expect("append");
        store
            .publish(&conversation, &TokenPayload::Audio("data:audio/mp3;base64,QQ==".to_string()))
            .await
            .expect("publish");

        assert_eq!(rx.recv().await, Some(ClientEvent::Reasoning("why".to_string())));
        assert_eq!(rx.recv().await, Some(ClientEvent::Token("because".to_string())));
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::Audio("data:audio/mp3;base64,QQ==".to_string()))
        );
    }

    #[tokio::test]
    async fn rejoin_replaces_the_prior_subscription() {
        let store = Arc::new(FanoutStore::new(record("u1")));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );
        let connection = ConnectionId::new("conn-1");
        let user = UserId::new("u1");

        let _first = manager
            .join(&connection, &user, &ConversationId::new("c1"))
            .await
            .expect("first join");
        let _second = manager
            .join(&connection, &user, &ConversationId::new("c2"))
            .await
            .expect("second join");

        assert_eq!(manager.active_subscriptions().expect("count"), 1);
        assert_eq!(
            manager
                .subscribed_conversation(&connection)
                .expect("lookup"),
            Some(ConversationId::new("c2"))
        );
    }

    #[tokio::test]
    async fn join_is_rejected_for_a_foreign_conversation() {
        let store = Arc::new(FanoutStore::new(record("owner")));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );

        let error = manager
            .join(
                &ConnectionId::new("conn-1"),
                &UserId::new("intruder"),
                &ConversationId::new("c1"),
            )
            .await
            .expect_err("not the owner");
        assert_eq!(error.kind, crate::SessionErrorKind::Unauthorized);
        assert_eq!(manager.active_subscriptions().expect("count"), 0);
    }

    #[tokio::test]
    async fn disconnect_tears_the_subscription_down() {
        let store = Arc::new(FanoutStore::new(record("u1")));
        let manager = SessionManager::new(
            Arc::clone(&store) as Arc<dyn ChatStateStore>,
            PollSettings::default(),
        );
        let connection = ConnectionId::new("conn-1");

        let _rx = manager
            .join(&connection, &UserId::new("u1"), &ConversationId::new("c1"))
            .await
            .expect("join");
        assert_eq!(manager.active_subscriptions().expect("count"), 1);

        manager.disconnect(&connection).expect("disconnect");
        assert_eq!(manager.active_subscriptions().expect("count"), 0);
    }

    #[tokio::test]
    async fn fallback_join_polls_to_a_resume_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ChatStateStore> = Arc::new(
            rstore::LocalStateStore::open(dir.path().join("state.json")).expect("open"),
        );
        let user = UserId::new("u1");
        let conversation = ConversationId::new("c1");
        store
            .init_conversation(&user, &conversation, "m", "t")
            .await
            .expect("init");

        let manager = SessionManager::new(
            Arc::clone(&store),
            PollSettings::default()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(50),
        );

        assert!(store.begin_streaming(&conversation).await.expect("begin"));
        store
            .append_token(&conversation, &TokenPayload::Answer("partial".to_string()))
            .await
            .expect("append");

        let mut rx = manager
            .join(&ConnectionId::new("conn-1"), &user, &conversation)
            .await
            .expect("join");
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::StreamProgress("partial".to_string()))
        );

        store
            .append_token(&conversation, &TokenPayload::Answer(" answer".to_string()))
            .await
            .expect("append");
        store.finish_streaming(&conversation).await.expect("finish");

        let events = collect_until_ended(&mut rx).await;
        assert_eq!(
            events,
            vec![
                ClientEvent::StreamResume("partial answer".to_string()),
                ClientEvent::StreamEnded,
            ]
        );
    }

    #[tokio::test]
    async fn fallback_join_times_out_when_the_stream_never_finishes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ChatStateStore> = Arc::new(
            rstore::LocalStateStore::open(dir.path().join("state.json")).expect("open"),
        );
        let user = UserId::new("u1");
        let conversation = ConversationId::new("c1");
        store
            .init_conversation(&user, &conversation, "m", "t")
            .await
            .expect("init");

        let manager = SessionManager::new(
            Arc::clone(&store),
            PollSettings::default()
                .with_interval(Duration::from_millis(5))
                .with_max_attempts(3),
        );

        assert!(store.begin_streaming(&conversation).await.expect("begin"));

        let mut rx = manager
            .join(&ConnectionId::new("conn-1"), &user, &conversation)
            .await
            .expect("join");
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::StreamProgress(String::new()))
        );
        assert_eq!(rx.recv().await, Some(ClientEvent::StreamTimeout));
    }

    #[tokio::test]
    async fn fallback_resume_uses_the_persisted_message_after_buffer_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ChatStateStore> = Arc::new(
            rstore::LocalStateStore::open(dir.path().join("state.json")).expect("open"),
        );
        let user = UserId::new("u1");
        let conversation = ConversationId::new("c1");
        store
            .init_conversation(&user, &conversation, "m", "t")
            .await
            .expect("init");

        let manager = SessionManager::new(
            Arc::clone(&store),
            PollSettings::default()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(50),
        );

        assert!(store.begin_streaming(&conversation).await.expect("begin"));
        let mut rx = manager
            .join(&ConnectionId::new("conn-1"), &user, &conversation)
            .await
            .expect("join");
        let _ = rx.recv().await;

        // Persist before flipping the flag so the poll only ever observes
        // the finished state.
        store
            .append_message(
                &conversation,
                StoredMessage::new(MessageRole::Assistant, "persisted answer"),
            )
            .await
            .expect("persist");
        store.finish_streaming(&conversation).await.expect("finish");
        store.clear_buffer(&conversation).await.expect("clear");

        let events = collect_until_ended(&mut rx).await;
        assert_eq!(
            events,
            vec![
                ClientEvent::StreamResume("persisted answer".to_string()),
                ClientEvent::StreamEnded,
            ]
        );
    }
}
