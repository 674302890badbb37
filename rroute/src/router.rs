//! Pure provider resolution.
//!
//! `resolve` maps a model identifier and the caller's available credentials
//! to a concrete upstream target. It performs no I/O and is deterministic
//! for identical inputs, which is what makes routing decisions testable in
//! isolation.

use crate::catalog::{is_trial_model, ProviderCatalog, ProviderConfig, WireProtocol};
use crate::credentials::CredentialSet;
use crate::error::RouteError;

/// Everything the relay needs to issue one upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub provider: ProviderConfig,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub trial: bool,
}

impl ResolvedRoute {
    pub fn protocol(&self) -> WireProtocol {
        self.provider.protocol()
    }
}

/// Resolves a model identifier to an upstream target.
///
/// Decision order:
/// 1. Trial model with no user key for its provider and none for the
///    aggregator: route through the aggregator on the shared key, marked as
///    a trial request.
/// 2. User key matching the model's own provider prefix: direct route.
/// 3. User key for the aggregator: aggregator route, full model id forwarded.
/// 4. Otherwise resolution fails; no upstream request is attempted.
pub fn resolve(
    catalog: &ProviderCatalog,
    model_id: &str,
    credentials: &CredentialSet,
    shared_key: Option<&str>,
) -> Result<ResolvedRoute, RouteError> {
    let (prefix, rest) = model_id.split_once('/').ok_or_else(|| {
        RouteError::unknown_model(format!(
            "model '{model_id}' has no provider prefix"
        ))
    })?;

    let aggregator = catalog.aggregator();
    let aggregator_name = catalog.aggregator_name();

    if is_trial_model(model_id)
        && !credentials.contains(prefix)
        && !credentials.contains(aggregator_name)
    {
        if let Some(key) = shared_key {
            let model = strip_prefix(model_id, aggregator_name);
            return Ok(ResolvedRoute {
                endpoint: aggregator.endpoint(&model, key),
                provider: aggregator.clone(),
                api_key: key.to_string(),
                model,
                trial: true,
            });
        }
    }

    if let Some(config) = catalog.get(prefix) {
        if let Some(key) = credentials.get(prefix) {
            return Ok(ResolvedRoute {
                endpoint: config.endpoint(rest, key),
                provider: config.clone(),
                api_key: key.to_string(),
                model: rest.to_string(),
                trial: false,
            });
        }
    }

    if let Some(key) = credentials.get(aggregator_name) {
        let model = strip_prefix(model_id, aggregator_name);
        return Ok(ResolvedRoute {
            endpoint: aggregator.endpoint(&model, key),
            provider: aggregator.clone(),
            api_key: key.to_string(),
            model,
            trial: false,
        });
    }

    Err(RouteError::not_configured(format!(
        "no provider or key configured for model '{model_id}'"
    )))
}

/// The aggregator expects the raw vendor/model string without its own
/// prefix; anything else is forwarded whole.
fn strip_prefix(model_id: &str, provider: &str) -> String {
    match model_id.split_once('/') {
        Some((prefix, rest)) if prefix == provider => rest.to_string(),
        _ => model_id.to_string(),
    }
}
