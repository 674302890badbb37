//! Declarative provider catalog.
//!
//! Each configured provider carries enough data to assemble a request:
//! base URL, completion path, auth header name and scheme (either may be
//! absent), and the wire protocol its completion endpoint speaks. Unusual
//! providers are expressed as data, not as code branches: a provider with
//! no auth header embeds its key in the completion path through the
//! `{key}` placeholder.
//!
//! ```rust
//! use rroute::ProviderCatalog;
//!
//! let catalog = ProviderCatalog::builtin();
//! assert!(catalog.get("openrouter").is_some());
//! assert!(catalog.get("dial-up-bbs").is_none());
//! ```

/// Wire shape spoken by a provider's completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// OpenAI-compatible chat completions: SSE lines, `[DONE]` terminator.
    OpenAiSse,
    /// Google generateContent: single-shot JSON body, no incremental protocol.
    GoogleGenerate,
    /// Not yet wired to a native endpoint; calls fail with a readable notice.
    AnthropicStub,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    name: String,
    base_url: String,
    completion_path: String,
    auth_header: Option<String>,
    auth_scheme: Option<String>,
    protocol: WireProtocol,
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        completion_path: impl Into<String>,
        protocol: WireProtocol,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            completion_path: completion_path.into(),
            auth_header: None,
            auth_scheme: None,
            protocol,
        }
    }

    pub fn with_auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = Some(header.into());
        self
    }

    pub fn with_auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = Some(scheme.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auth_header(&self) -> Option<&str> {
        self.auth_header.as_deref()
    }

    pub fn auth_scheme(&self) -> Option<&str> {
        self.auth_scheme.as_deref()
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// Assembles the full completion endpoint, substituting the `{model}`
    /// and `{key}` placeholders where the path declares them.
    pub fn endpoint(&self, model: &str, key: &str) -> String {
        let path = self
            .completion_path
            .replace("{model}", model)
            .replace("{key}", key);
        format!("{}{}", self.base_url, path)
    }
}

/// The fixed set of providers this deployment knows how to talk to.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    providers: Vec<ProviderConfig>,
    aggregator: String,
}

impl ProviderCatalog {
    /// Catalog with the built-in providers and `openrouter` as the
    /// aggregator.
    pub fn builtin() -> Self {
        Self {
            providers: vec![
                ProviderConfig::new(
                    "openrouter",
                    "https://openrouter.ai/api/v1",
                    "/chat/completions",
                    WireProtocol::OpenAiSse,
                )
                .with_auth_header("Authorization")
                .with_auth_scheme("Bearer"),
                ProviderConfig::new(
                    "openai",
                    "https://api.openai.com/v1",
                    "/chat/completions",
                    WireProtocol::OpenAiSse,
                )
                .with_auth_header("Authorization")
                .with_auth_scheme("Bearer"),
                ProviderConfig::new(
                    "anthropic",
                    "https://api.anthropic.com/v1",
                    "/messages",
                    WireProtocol::AnthropicStub,
                )
                .with_auth_header("x-api-key"),
                ProviderConfig::new(
                    "google",
                    "https://generativelanguage.googleapis.com",
                    "/v1beta/models/{model}:generateContent?key={key}",
                    WireProtocol::GoogleGenerate,
                ),
            ],
            aggregator: "openrouter".to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|config| config.name == name)
    }

    pub fn aggregator(&self) -> &ProviderConfig {
        // The aggregator name always points at a catalog entry; builtin()
        // establishes that and there is no removal API.
        self.providers
            .iter()
            .find(|config| config.name == self.aggregator)
            .unwrap_or(&self.providers[0])
    }

    pub fn aggregator_name(&self) -> &str {
        &self.aggregator
    }
}

/// Models usable without a user credential, charged against the trial quota.
pub const TRIAL_MODELS: &[&str] = &[
    "openrouter/openai/gpt-4o-mini",
    "openrouter/google/gemini-2.0-flash",
    "openrouter/meta-llama/llama-3.1-8b-instruct",
];

pub fn is_trial_model(model_id: &str) -> bool {
    TRIAL_MODELS.contains(&model_id)
}
