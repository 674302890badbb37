//! The seam between the relay and upstream completion endpoints.

use std::pin::Pin;

use futures_core::Stream;
use rcommon::BoxFuture;
use rroute::ResolvedRoute;
use rstore::{MessageRole, StoredMessage};
use serde::Serialize;

use crate::error::RelayError;

/// One increment of generated output, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenUnit {
    Answer(String),
    Reasoning(String),
}

pub type BoxedTokenStream = Pin<Box<dyn Stream<Item = Result<TokenUnit, RelayError>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

impl From<&StoredMessage> for CompletionMessage {
    fn from(message: &StoredMessage) -> Self {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<CompletionMessage>,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn from_history(model: impl Into<String>, history: &[StoredMessage]) -> Self {
        Self {
            model: model.into(),
            messages: history.iter().map(CompletionMessage::from).collect(),
            stream: true,
        }
    }
}

/// Issues one completion call and yields its output incrementally.
///
/// Returning `Err` from the future means no tokens were produced (bad
/// status, transport failure, stub provider); an `Err` item inside the
/// stream means the connection broke after some tokens already flowed.
pub trait CompletionBackend: Send + Sync {
    fn stream_completion<'a>(
        &'a self,
        route: &'a ResolvedRoute,
        request: CompletionRequest,
    ) -> BoxFuture<'a, Result<BoxedTokenStream, RelayError>>;
}
