//! Common imports for most rivulet applications.

pub use crate::{build_runtime, build_runtime_with, RuntimeBundle, RuntimeConfig};
pub use crate::{
    derive_title, is_trial_model, resolve, token_channel, BoxFuture, ChatStateStore, ClientEvent,
    CompletionBackend, CompletionRequest, ConnectionId, ConversationId, ConversationPatch,
    ConversationRecord, CredentialSet, HttpCompletionBackend, MessageRole, PollSettings,
    ProviderCatalog, QuotaEnforcer, QuotaLimits, RelayError, RelayErrorKind, RelayOutcome,
    RelayRequest, ResolvedRoute, RouteError, RouteErrorKind, SessionError, SessionErrorKind,
    SessionManager, SpeechSynthesizer, StoreConfig, StoreError, StoreErrorKind, StoredMessage,
    StreamRelay, TokenPayload, TokenUnit, UserId, WireProtocol, DEFAULT_TITLE,
};
