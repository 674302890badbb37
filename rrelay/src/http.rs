//! HTTP completion backend over reqwest.
//!
//! Exactly three upstream call shapes exist, selected by the wire protocol
//! tag on the resolved route. Adding a provider means adding a variant
//! here, not widening branches across the relay.

use async_stream::stream;
use futures_util::StreamExt;
use metrics::counter;
use rcommon::BoxFuture;
use reqwest::{Client, RequestBuilder};
use rroute::{ResolvedRoute, WireProtocol};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{BoxedTokenStream, CompletionBackend, CompletionMessage, CompletionRequest, TokenUnit};
use crate::error::RelayError;

/// Characters per reveal chunk when faking incremental delivery of a
/// single-shot response body.
const REVEAL_CHUNK_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCall {
    OpenAiCompatible,
    GoogleGenerate,
    AnthropicStub,
}

impl ProviderCall {
    pub fn for_route(route: &ResolvedRoute) -> Self {
        match route.protocol() {
            WireProtocol::OpenAiSse => Self::OpenAiCompatible,
            WireProtocol::GoogleGenerate => Self::GoogleGenerate,
            WireProtocol::AnthropicStub => Self::AnthropicStub,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpCompletionBackend {
    client: Client,
}

impl HttpCompletionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn apply_auth(&self, builder: RequestBuilder, route: &ResolvedRoute) -> RequestBuilder {
        match route.provider.auth_header() {
            Some(header) => {
                let value = match route.provider.auth_scheme() {
                    Some(scheme) => format!("{scheme} {}", route.api_key),
                    None => route.api_key.clone(),
                };
                builder.header(header, value)
            }
            None => builder,
        }
    }

    async fn open_ai_sse(
        &self,
        route: &ResolvedRoute,
        request: CompletionRequest,
    ) -> Result<BoxedTokenStream, RelayError> {
        let provider = route.provider.name().to_string();
        let builder = self.client.post(&route.endpoint).json(&request);
        let response = self
            .apply_auth(builder, route)
            .send()
            .await
            .map_err(|error| {
                RelayError::upstream(format!("{provider} request failed: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::upstream(format!(
                "{provider} returned status {status}: {}",
                body.trim()
            )));
        }

        let mut chunks = response.bytes_stream();
        let stream = stream! {
            let mut sse_buffer = String::new();
            'outer: while let Some(item) = chunks.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(RelayError::upstream(format!(
                            "{provider} stream aborted: {error}"
                        )));
                        break;
                    }
                };
                sse_buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline_index) = sse_buffer.find('\n') {
                    let line = sse_buffer.drain(..=newline_index).collect::<String>();
                    let line = line.trim();

                    if !line.starts_with("data:") {
                        continue;
                    }

                    let payload = line.trim_start_matches("data:").trim();
                    if payload == "[DONE]" {
                        break 'outer;
                    }

                    let parsed: SseChunk = match serde_json::from_str(payload) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            // One bad chunk does not abort the stream.
                            warn!(%provider, %error, "skipping malformed stream chunk");
                            counter!("rivulet_relay_malformed_chunks").increment(1);
                            continue;
                        }
                    };

                    if let Some(choice) = parsed.choices.first() {
                        if let Some(reasoning) = choice.delta.reasoning_fragment() {
                            if !reasoning.is_empty() {
                                yield Ok(TokenUnit::Reasoning(reasoning.to_string()));
                            }
                        }
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty() {
                                yield Ok(TokenUnit::Answer(content.clone()));
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn google_generate(
        &self,
        route: &ResolvedRoute,
        request: CompletionRequest,
    ) -> Result<BoxedTokenStream, RelayError> {
        let provider = route.provider.name().to_string();
        let body = GoogleRequest::from_messages(&request.messages);
        let response = self
            .client
            .post(&route.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                RelayError::upstream(format!("{provider} request failed: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::upstream(format!(
                "{provider} returned status {status}: {}",
                body.trim()
            )));
        }

        let parsed: GoogleResponse = response.json().await.map_err(|error| {
            RelayError::upstream(format!("{provider} response unreadable: {error}"))
        })?;
        let text = parsed.full_text();

        // No incremental protocol here: reveal the finished body piecewise
        // so subscribers see the same streaming UX as the SSE providers.
        let stream = stream! {
            let characters: Vec<char> = text.chars().collect();
            for chunk in characters.chunks(REVEAL_CHUNK_CHARS) {
                yield Ok(TokenUnit::Answer(chunk.iter().collect()));
            }
        };

        Ok(Box::pin(stream))
    }
}

impl CompletionBackend for HttpCompletionBackend {
    fn stream_completion<'a>(
        &'a self,
        route: &'a ResolvedRoute,
        request: CompletionRequest,
    ) -> BoxFuture<'a, Result<BoxedTokenStream, RelayError>> {
        Box::pin(async move {
            match ProviderCall::for_route(route) {
                ProviderCall::OpenAiCompatible => self.open_ai_sse(route, request).await,
                ProviderCall::GoogleGenerate => self.google_generate(route, request).await,
                ProviderCall::AnthropicStub => Err(RelayError::upstream(
                    "anthropic is not wired to a native endpoint yet; add an \
                     aggregator key to use anthropic models",
                )),
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl SseDelta {
    /// Providers disagree on the field name for reasoning deltas.
    fn reasoning_fragment(&self) -> Option<&str> {
        self.reasoning
            .as_deref()
            .or(self.reasoning_content.as_deref())
    }
}

#[derive(Debug, Serialize)]
struct GoogleRequest {
    contents: Vec<GoogleContent>,
}

impl GoogleRequest {
    fn from_messages(messages: &[CompletionMessage]) -> Self {
        Self {
            contents: messages
                .iter()
                .map(|message| GoogleContent {
                    role: match message.role.as_str() {
                        "assistant" => "model".to_string(),
                        _ => "user".to_string(),
                    },
                    parts: vec![GooglePart {
                        text: message.content.clone(),
                    }],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleContent {
    role: String,
    parts: Vec<GooglePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GooglePart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
}

impl GoogleResponse {
    fn full_text(&self) -> String {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .map(|part| part.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
}
