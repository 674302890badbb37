//! Chat state storage with a networked primary and a local fallback.

mod backends;
mod error;
mod store;
mod types;

pub use backends::local::LocalStateStore;
pub use backends::redis::RedisStateStore;
pub use error::{StoreError, StoreErrorKind};
pub use store::{
    connect_state_store, BoxedPayloadStream, ChatStateStore, StoreConfig, TokenSubscription,
};
pub use types::{
    now_unix_secs, BranchLineage, ConversationPatch, ConversationRecord, MessageRole, ShareState,
    StoredMessage,
};
