//! Unified facade over the rivulet workspace crates.
//!
//! This crate is designed to be the single dependency for most applications.
//! It re-exports the core rivulet crates and provides the runtime wiring
//! helpers that assemble a working streaming stack.

pub mod prelude;
pub mod runtime;

pub use rcommon;
pub use rrelay;
pub use rroute;
pub use rsession;
pub use rstore;

pub use rcommon::{
    AuthError, AuthErrorKind, AuthVerifier, BoxFuture, ConnectionId, ConversationId,
    DocumentExtractor, SpeechTranscriber, TokenPayload, UserId, AUDIO_PREFIX, REASONING_PREFIX,
    token_channel,
};
pub use rrelay::{
    BoxedTokenStream, CompletionBackend, CompletionMessage, CompletionRequest,
    HttpCompletionBackend, ProviderCall, QuotaEnforcer, QuotaLimits, RelayError, RelayErrorKind,
    RelayOutcome, RelayRequest, SpeechSynthesizer, StreamRelay, TokenUnit, derive_title,
    needs_title, DEFAULT_TITLE,
};
pub use rroute::{
    is_trial_model, resolve, CredentialSet, ProviderCatalog, ProviderConfig, ResolvedRoute,
    RouteError, RouteErrorKind, WireProtocol, TRIAL_MODELS,
};
pub use rsession::{ClientEvent, PollSettings, SessionError, SessionErrorKind, SessionManager};
pub use rstore::{
    connect_state_store, now_unix_secs, BoxedPayloadStream, BranchLineage, ChatStateStore,
    ConversationPatch, ConversationRecord, LocalStateStore, MessageRole, RedisStateStore,
    ShareState, StoreConfig, StoreError, StoreErrorKind, StoredMessage, TokenSubscription,
};

pub use runtime::{build_runtime, build_runtime_with, RuntimeBundle, RuntimeConfig};
