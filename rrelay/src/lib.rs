//! Streaming relay: drives upstream completions into the chat state store.

mod backend;
mod error;
mod http;
mod quota;
mod relay;
mod title;

pub use backend::{
    BoxedTokenStream, CompletionBackend, CompletionMessage, CompletionRequest, TokenUnit,
};
pub use error::{RelayError, RelayErrorKind};
pub use http::{HttpCompletionBackend, ProviderCall};
pub use quota::{QuotaEnforcer, QuotaLimits};
pub use relay::{RelayOutcome, RelayRequest, SpeechSynthesizer, StreamRelay};
pub use title::{derive_title, needs_title, DEFAULT_TITLE};
