//! Deterministic provider routing over a declarative catalog.

mod catalog;
mod credentials;
mod error;
mod router;

pub use catalog::{is_trial_model, ProviderCatalog, ProviderConfig, WireProtocol, TRIAL_MODELS};
pub use credentials::CredentialSet;
pub use error::{RouteError, RouteErrorKind};
pub use router::{resolve, ResolvedRoute};
