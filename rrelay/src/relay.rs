//! Drives one upstream generation into the conversation's buffer and
//! fan-out channel.
//!
//! Failure discipline: quota exhaustion and upstream failures are rendered
//! as ordinary streamed content and persisted like any assistant message,
//! so clients need no separate error path. The only hard errors `run`
//! returns are a concurrent-generation rejection and store failures. The
//! streaming flag is cleared on every path out.

use std::sync::Arc;

use futures_util::StreamExt;
use metrics::counter;
use rcommon::{BoxFuture, ConversationId, TokenPayload, UserId};
use rroute::ResolvedRoute;
use rstore::{ChatStateStore, ConversationPatch, MessageRole, StoredMessage};
use tracing::warn;

use crate::backend::{CompletionBackend, CompletionRequest, TokenUnit};
use crate::error::{RelayError, RelayErrorKind};
use crate::quota::QuotaEnforcer;
use crate::title::{derive_title, needs_title};

/// Produces an audio rendition of a finished answer as a data URI.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<String, RelayError>>;
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    /// Model identifier as the user selected it, recorded on the message.
    pub model_id: String,
    pub route: ResolvedRoute,
    pub prompt: String,
    pub attachments: Vec<String>,
}

impl RelayRequest {
    pub fn new(
        user_id: UserId,
        conversation_id: ConversationId,
        model_id: impl Into<String>,
        route: ResolvedRoute,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            conversation_id,
            model_id: model_id.into(),
            route,
            prompt: prompt.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// What one relay run amounted to. Inline-rendered failures come back as
/// `Ok` with the failure variant, never as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed {
        content: String,
        reasoning: Option<String>,
    },
    TrialLimit,
    UpstreamFailed {
        notice: String,
    },
}

pub struct StreamRelay {
    store: Arc<dyn ChatStateStore>,
    backend: Arc<dyn CompletionBackend>,
    quota: QuotaEnforcer,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
}

impl StreamRelay {
    pub fn new(
        store: Arc<dyn ChatStateStore>,
        backend: Arc<dyn CompletionBackend>,
        quota: QuotaEnforcer,
    ) -> Self {
        Self {
            store,
            backend,
            quota,
            speech: None,
        }
    }

    pub fn with_speech_synthesizer(mut self, speech: Arc<dyn SpeechSynthesizer>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub async fn run(&self, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
        if request.route.trial && !self.quota.check_message_quota(&request.user_id).await? {
            counter!("rivulet_relay_quota_rejections").increment(1);
            let notice = format!(
                "You have used all {} free trial messages. Add your own provider \
                 key to keep chatting.",
                self.quota.limits().trial_messages
            );
            self.stream_notice(&request, &notice).await?;
            return Ok(RelayOutcome::TrialLimit);
        }

        if !self.store.begin_streaming(&request.conversation_id).await? {
            return Err(RelayError::busy(format!(
                "a generation is already in flight for conversation '{}'",
                request.conversation_id
            )));
        }

        // The advisory lock is held from here; every exit below must clear
        // the streaming flag.
        let generated = self.generate(&request).await;
        let generated = match generated {
            Ok(generated) => generated,
            Err(error) => {
                if let Err(finish_error) =
                    self.store.finish_streaming(&request.conversation_id).await
                {
                    warn!(%finish_error, "failed to clear streaming flag after relay error");
                }
                return Err(error);
            }
        };

        let Generated {
            answer,
            reasoning,
            failure_notice,
        } = generated;

        // Inline failure texts become (part of) the assistant message so
        // the history matches what the client rendered.
        let content = match &failure_notice {
            Some(content) => content.clone(),
            None => answer.clone(),
        };
        let mut message = StoredMessage::new(MessageRole::Assistant, content);
        if !reasoning.is_empty() {
            message = message.with_reasoning(reasoning.clone());
        }
        message = message.with_model(request.model_id.clone());

        // Persist before the flag flips so a polling subscriber observing
        // the finished state always finds the content.
        if let Err(error) = self
            .store
            .append_message(&request.conversation_id, message)
            .await
        {
            if let Err(finish_error) = self.store.finish_streaming(&request.conversation_id).await
            {
                warn!(%finish_error, "failed to clear streaming flag after relay error");
            }
            return Err(error.into());
        }

        self.store.finish_streaming(&request.conversation_id).await?;
        self.store.clear_buffer(&request.conversation_id).await?;

        self.apply_title(&request).await?;

        if failure_notice.is_none() && request.route.trial {
            self.quota.charge_message(&request.user_id).await?;
        }

        if failure_notice.is_none() {
            self.synthesize_speech(&request, &answer).await;
        }

        match failure_notice {
            Some(notice) => Ok(RelayOutcome::UpstreamFailed { notice }),
            None => Ok(RelayOutcome::Completed {
                content: answer,
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
            }),
        }
    }

    /// Streams the upstream response into the buffer, accumulating answer
    /// and reasoning separately for the persisted message. Assumes the
    /// advisory lock is held.
    async fn generate(&self, request: &RelayRequest) -> Result<Generated, RelayError> {
        let user_message = StoredMessage::new(MessageRole::User, request.prompt.clone())
            .with_attachments(request.attachments.clone());
        self.store
            .append_message(&request.conversation_id, user_message)
            .await?;

        let record = self
            .store
            .get_conversation(&request.conversation_id)
            .await?
            .ok_or_else(|| {
                RelayError::store(format!(
                    "conversation '{}' vanished mid-request",
                    request.conversation_id
                ))
            })?;
        let completion =
            CompletionRequest::from_history(request.route.model.clone(), &record.messages);

        let mut stream = match self
            .backend
            .stream_completion(&request.route, completion)
            .await
        {
            Ok(stream) => stream,
            Err(error) if matches!(error.kind, RelayErrorKind::Store) => return Err(error),
            Err(error) => {
                let notice = inline_failure_text(&error);
                self.append_notice(&request.conversation_id, &notice).await?;
                return Ok(Generated::failed(notice));
            }
        };

        let mut answer = String::new();
        let mut reasoning = String::new();

        while let Some(unit) = stream.next().await {
            match unit {
                Ok(TokenUnit::Answer(text)) => {
                    self.store
                        .append_token(&request.conversation_id, &TokenPayload::Answer(text.clone()))
                        .await?;
                    counter!("rivulet_relay_tokens_published").increment(1);
                    answer.push_str(&text);
                }
                Ok(TokenUnit::Reasoning(text)) => {
                    self.store
                        .append_token(
                            &request.conversation_id,
                            &TokenPayload::Reasoning(text.clone()),
                        )
                        .await?;
                    counter!("rivulet_relay_tokens_published").increment(1);
                    reasoning.push_str(&text);
                }
                Err(error) => {
                    // Stream the notice after the partial answer and persist
                    // both, so history matches what subscribers rendered.
                    let notice = inline_failure_text(&error);
                    let separator = if answer.is_empty() { "" } else { "\n\n" };
                    self.append_notice(&request.conversation_id, &format!("{separator}{notice}"))
                        .await?;
                    let content = format!("{answer}{separator}{notice}");
                    return Ok(Generated {
                        answer,
                        reasoning,
                        failure_notice: Some(content),
                    });
                }
            }
        }

        Ok(Generated {
            answer,
            reasoning,
            failure_notice: None,
        })
    }

    /// Publishes a failure text as ordinary content.
    async fn append_notice(
        &self,
        conversation_id: &ConversationId,
        notice: &str,
    ) -> Result<(), RelayError> {
        counter!("rivulet_relay_inline_failures").increment(1);
        warn!(%conversation_id, %notice, "rendering inline failure");
        self.store
            .append_token(conversation_id, &TokenPayload::Answer(notice.to_string()))
            .await?;
        Ok(())
    }

    /// Full inline envelope for failures detected before the lock would
    /// normally be taken (the trial-limit short circuit).
    async fn stream_notice(
        &self,
        request: &RelayRequest,
        notice: &str,
    ) -> Result<(), RelayError> {
        if !self.store.begin_streaming(&request.conversation_id).await? {
            return Err(RelayError::busy(format!(
                "a generation is already in flight for conversation '{}'",
                request.conversation_id
            )));
        }

        let user_message = StoredMessage::new(MessageRole::User, request.prompt.clone())
            .with_attachments(request.attachments.clone());
        self.store
            .append_message(&request.conversation_id, user_message)
            .await?;

        let result = self.append_notice(&request.conversation_id, notice).await;
        if result.is_ok() {
            self.store
                .append_message(
                    &request.conversation_id,
                    StoredMessage::new(MessageRole::Assistant, notice),
                )
                .await?;
        }
        self.store.finish_streaming(&request.conversation_id).await?;
        self.store.clear_buffer(&request.conversation_id).await?;
        result
    }

    async fn apply_title(&self, request: &RelayRequest) -> Result<(), RelayError> {
        let record = self
            .store
            .get_conversation(&request.conversation_id)
            .await?;
        let Some(record) = record else {
            return Ok(());
        };

        if needs_title(&record.title) {
            let title = derive_title(&request.prompt);
            if !title.is_empty() {
                self.store
                    .update_conversation(
                        &request.conversation_id,
                        ConversationPatch::default().with_title(title),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Post-completion audio rendition. Failures here never affect the
    /// already-persisted answer.
    async fn synthesize_speech(&self, request: &RelayRequest, answer: &str) {
        let Some(speech) = &self.speech else {
            return;
        };
        if answer.is_empty() {
            return;
        }

        match speech.synthesize(answer).await {
            Ok(data_uri) => {
                let publish = self
                    .store
                    .publish(&request.conversation_id, &TokenPayload::Audio(data_uri.clone()))
                    .await;
                if let Err(error) = publish {
                    warn!(%error, "failed to publish audio payload");
                }
                if let Err(error) = self
                    .store
                    .attach_audio(&request.conversation_id, &data_uri)
                    .await
                {
                    warn!(%error, "failed to attach audio to the persisted message");
                }
            }
            Err(error) => {
                warn!(%error, "speech synthesis failed");
            }
        }
    }
}

struct Generated {
    answer: String,
    reasoning: String,
    failure_notice: Option<String>,
}

impl Generated {
    fn failed(notice: String) -> Self {
        Self {
            answer: String::new(),
            reasoning: String::new(),
            failure_notice: Some(notice),
        }
    }
}

fn inline_failure_text(error: &RelayError) -> String {
    format!("Generation failed: {}", error.message)
}
