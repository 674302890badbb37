//! Conversation record, message, and partial-update types.
//!
//! ```rust
//! use rstore::{ConversationPatch, ConversationRecord, MessageRole, StoredMessage};
//!
//! let mut record = ConversationRecord::new("user-1", "openai/gpt-4o", "New chat");
//! record.messages.push(StoredMessage::new(MessageRole::User, "hello"));
//!
//! ConversationPatch::default().with_title("Greetings").apply(&mut record);
//! assert_eq!(record.title, "Greetings");
//! assert_eq!(record.messages.len(), 1);
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl StoredMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            audio: None,
            attachments: Vec::new(),
            model: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Sharing metadata; set when the owner publishes the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareState {
    pub shared: bool,
    pub shared_at_secs: i64,
}

/// Fork lineage: the conversation this one was branched from, and the
/// message index at which the branch was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLineage {
    pub source_conversation: String,
    pub branch_point: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub user_id: String,
    pub model: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub streaming: bool,
    pub created_at_secs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchLineage>,
}

impl ConversationRecord {
    pub fn new(
        user_id: impl Into<String>,
        model: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            model: model.into(),
            title: title.into(),
            messages: Vec::new(),
            streaming: false,
            created_at_secs: now_unix_secs(),
            share: None,
            branch: None,
        }
    }

    pub fn last_assistant_message(&self) -> Option<&StoredMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }
}

/// Partial update: only supplied fields change, unsupplied fields are kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationPatch {
    pub model: Option<String>,
    pub title: Option<String>,
    pub messages: Option<Vec<StoredMessage>>,
    pub streaming: Option<bool>,
    pub share: Option<ShareState>,
    pub branch: Option<BranchLineage>,
}

impl ConversationPatch {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<StoredMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn with_share(mut self, share: ShareState) -> Self {
        self.share = Some(share);
        self
    }

    pub fn with_branch(mut self, branch: BranchLineage) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.title.is_none()
            && self.messages.is_none()
            && self.streaming.is_none()
            && self.share.is_none()
            && self.branch.is_none()
    }

    pub fn apply(&self, record: &mut ConversationRecord) {
        if let Some(model) = &self.model {
            record.model = model.clone();
        }

        if let Some(title) = &self.title {
            record.title = title.clone();
        }

        if let Some(messages) = &self.messages {
            record.messages = messages.clone();
        }

        if let Some(streaming) = self.streaming {
            record.streaming = streaming;
        }

        if let Some(share) = self.share {
            record.share = Some(share);
        }

        if let Some(branch) = &self.branch {
            record.branch = Some(branch.clone());
        }
    }
}

pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merges_only_supplied_fields() {
        let mut record = ConversationRecord::new("u1", "openai/gpt-4o", "New chat");
        record.messages.push(StoredMessage::new(MessageRole::User, "hi"));

        ConversationPatch::default()
            .with_streaming(true)
            .apply(&mut record);

        assert!(record.streaming);
        assert_eq!(record.title, "New chat");
        assert_eq!(record.model, "openai/gpt-4o");
        assert_eq!(record.messages.len(), 1);
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let mut record = ConversationRecord::new("u1", "m", "t");
        let before = record.clone();

        let patch = ConversationPatch::default();
        assert!(patch.is_empty());
        patch.apply(&mut record);
        assert_eq!(record, before);
    }

    #[test]
    fn record_serde_round_trips_optional_fields() {
        let mut record = ConversationRecord::new("u1", "openai/gpt-4o", "Title");
        record.branch = Some(BranchLineage {
            source_conversation: "c0".to_string(),
            branch_point: 3,
        });
        record.messages.push(
            StoredMessage::new(MessageRole::Assistant, "answer")
                .with_reasoning("thought")
                .with_model("gpt-4o"),
        );

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: ConversationRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
    }

    #[test]
    fn last_assistant_message_skips_trailing_user_turns() {
        let mut record = ConversationRecord::new("u1", "m", "t");
        record.messages.push(StoredMessage::new(MessageRole::User, "q1"));
        record
            .messages
            .push(StoredMessage::new(MessageRole::Assistant, "a1"));
        record.messages.push(StoredMessage::new(MessageRole::User, "q2"));

        let last = record.last_assistant_message().expect("assistant present");
        assert_eq!(last.content, "a1");
    }
}
