//! Shared primitives for the rivulet workspace crates.
//!
//! ```rust
//! use rcommon::{ConversationId, TokenPayload, UserId, token_channel};
//!
//! let user = UserId::from("user-1");
//! let conversation = ConversationId::new("conv-1");
//!
//! assert_eq!(user.as_str(), "user-1");
//! assert_eq!(token_channel(&conversation), "conv-1/tokens");
//! assert_eq!(TokenPayload::Answer("hi".into()).encode(), "hi");
//! ```

pub mod future {
    //! Shared async future alias.
    //!
    //! ```rust
    //! use rcommon::BoxFuture;
    //!
    //! fn str_len<'a>(value: &'a str) -> BoxFuture<'a, usize> {
    //!     Box::pin(async move { value.len() })
    //! }
    //!
    //! let _future = str_len("hello");
    //! ```

    use std::future::Future;
    use std::pin::Pin;

    pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
}

pub mod context {
    //! Cross-crate identifier newtypes.
    //!
    //! ```rust
    //! use rcommon::{ConnectionId, ConversationId, UserId};
    //!
    //! let user = UserId::new("user-42");
    //! let conversation = ConversationId::from("conv-42");
    //! let connection = ConnectionId::from("ws-42");
    //!
    //! assert_eq!(user.to_string(), "user-42");
    //! assert_eq!(conversation.as_str(), "conv-42");
    //! assert_eq!(connection.as_str(), "ws-42");
    //! ```

    use std::fmt::{Display, Formatter};

    macro_rules! string_id {
        ($name:ident) => {
            #[derive(Debug, Clone, PartialEq, Eq, Hash)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    self.0.as_str()
                }
            }

            impl Display for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        };
    }

    string_id!(UserId);
    string_id!(ConversationId);
    string_id!(ConnectionId);
}

pub mod payload {
    //! Fan-out channel naming and sentinel-tagged payload encoding.
    //!
    //! Published payloads are plain strings. An untagged string is an answer
    //! token; [`REASONING_PREFIX`] marks a reasoning token; [`AUDIO_PREFIX`]
    //! (followed by a data URI) marks a synthesized-audio payload. Consumers
    //! must decode before treating a payload as plain content.
    //!
    //! ```rust
    //! use rcommon::{ConversationId, TokenPayload, token_channel};
    //!
    //! assert_eq!(token_channel(&ConversationId::new("c1")), "c1/tokens");
    //!
    //! let reasoning = TokenPayload::Reasoning("hmm".into()).encode();
    //! assert_eq!(TokenPayload::decode(&reasoning), TokenPayload::Reasoning("hmm".into()));
    //! assert_eq!(TokenPayload::decode("plain"), TokenPayload::Answer("plain".into()));
    //! ```

    use crate::context::ConversationId;

    pub const REASONING_PREFIX: &str = "::reasoning::";
    pub const AUDIO_PREFIX: &str = "::audio::";

    pub fn token_channel(conversation_id: &ConversationId) -> String {
        format!("{}/tokens", conversation_id.as_str())
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TokenPayload {
        Answer(String),
        Reasoning(String),
        Audio(String),
    }

    impl TokenPayload {
        pub fn encode(&self) -> String {
            match self {
                Self::Answer(text) => text.clone(),
                Self::Reasoning(text) => format!("{REASONING_PREFIX}{text}"),
                Self::Audio(data_uri) => format!("{AUDIO_PREFIX}{data_uri}"),
            }
        }

        pub fn decode(raw: &str) -> Self {
            if let Some(text) = raw.strip_prefix(REASONING_PREFIX) {
                return Self::Reasoning(text.to_string());
            }

            if let Some(data_uri) = raw.strip_prefix(AUDIO_PREFIX) {
                return Self::Audio(data_uri.to_string());
            }

            Self::Answer(raw.to_string())
        }
    }
}

pub mod boundary {
    //! Collaborator contracts implemented outside this subsystem.

    use std::error::Error;
    use std::fmt::{Display, Formatter};

    use crate::context::UserId;
    use crate::future::BoxFuture;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AuthErrorKind {
        Unauthorized,
        Other,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AuthError {
        pub kind: AuthErrorKind,
        pub message: String,
    }

    impl AuthError {
        pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
            Self {
                kind,
                message: message.into(),
            }
        }

        pub fn unauthorized(message: impl Into<String>) -> Self {
            Self::new(AuthErrorKind::Unauthorized, message)
        }

        pub fn other(message: impl Into<String>) -> Self {
            Self::new(AuthErrorKind::Other, message)
        }
    }

    impl Display for AuthError {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}: {}", self.kind, self.message)
        }
    }

    impl Error for AuthError {}

    /// Resolves a bearer token to the owning user.
    pub trait AuthVerifier: Send + Sync {
        fn verify<'a>(&'a self, bearer_token: &'a str)
        -> BoxFuture<'a, Result<UserId, AuthError>>;
    }

    /// Extracts plain text from an uploaded attachment reference.
    pub trait DocumentExtractor: Send + Sync {
        fn extract_text<'a>(
            &'a self,
            attachment_ref: &'a str,
        ) -> BoxFuture<'a, Result<String, AuthError>>;
    }

    /// Transcribes a speech attachment reference to text.
    pub trait SpeechTranscriber: Send + Sync {
        fn transcribe<'a>(
            &'a self,
            attachment_ref: &'a str,
        ) -> BoxFuture<'a, Result<String, AuthError>>;
    }
}

pub use boundary::{
    AuthError, AuthErrorKind, AuthVerifier, DocumentExtractor, SpeechTranscriber,
};
pub use context::{ConnectionId, ConversationId, UserId};
pub use future::BoxFuture;
pub use payload::{AUDIO_PREFIX, REASONING_PREFIX, TokenPayload, token_channel};
