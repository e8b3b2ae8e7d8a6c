//! Provider adapters with secure key handling.
//!
//! Two concrete adapters cover the v1 roster: [`AnthropicAdapter`] for the
//! messages API (primary preview and frontier models) and
//! [`OpenAiCompatAdapter`] for every chat-completions-shaped endpoint
//! (long-context model, free-tier fallback, local shim). Each adapter owns
//! a ring of API keys and rotates through it when a key is rate limited.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    ChunkStream, ModelRequest, ModelResponse, ProviderError, StreamChunk, TokenUsage,
    MAX_RESPONSE_LENGTH,
};

/// Behaviour common to all provider adapters.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Adapter name; doubles as the circuit-breaker name.
    fn name(&self) -> &str;

    /// Concrete model identifier.
    fn model(&self) -> &str;

    /// Failover layer: 1 = primary, higher = further down the chain.
    fn layer(&self) -> u8;

    /// Number of keys in the rotation ring.
    fn key_count(&self) -> usize;

    /// Complete a generation request.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError>;

    /// Open a generation stream. Errors here mean no chunk was emitted;
    /// failures after the first chunk arrive in-band as
    /// [`StreamChunk::Error`].
    async fn generate_stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError>;
}

//─────────────────────────────
//  Key rotation
//─────────────────────────────

/// Ring of API keys with a rotation cursor.
///
/// Rotation is advisory: concurrent callers may briefly share a key, which
/// only costs an extra rate-limit round trip.
pub(crate) struct KeyRing {
    keys: Vec<Secret<String>>,
    cursor: AtomicUsize,
}

impl KeyRing {
    pub(crate) fn new(keys: Vec<Secret<String>>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn current(&self) -> Option<&Secret<String>> {
        if self.keys.is_empty() {
            return None;
        }
        Some(&self.keys[self.cursor.load(Ordering::Relaxed) % self.keys.len()])
    }

    fn rotate(&self) {
        if !self.keys.is_empty() {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }
}

//─────────────────────────────
//  Shared HTTP plumbing
//─────────────────────────────

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("sos-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Network {
            provider: "gateway".into(),
            message: e.to_string(),
        })
}

fn transport_error(provider: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Network {
        provider: provider.to_owned(),
        message: err.to_string(),
    }
}

async fn classify_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(ProviderError::RateLimited {
            provider: provider.to_owned(),
        });
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        let message: String = message.chars().take(512).collect();
        return Err(ProviderError::Server {
            provider: provider.to_owned(),
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

fn check_content_len(provider: &str, content: &str) -> Result<(), ProviderError> {
    if content.len() > MAX_RESPONSE_LENGTH {
        return Err(ProviderError::InvalidResponse {
            provider: provider.to_owned(),
            message: format!("response too long: {} bytes", content.len()),
        });
    }
    Ok(())
}

//─────────────────────────────
//  SSE parsing
//─────────────────────────────

/// What one SSE data line means for the chunk stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseDelta {
    /// Emit a text chunk.
    Text(String),
    /// The stream finished cleanly.
    Done(Option<TokenUsage>),
    /// Bookkeeping event; emit nothing.
    Ignore,
}

/// Interpret one `data:` payload from either wire dialect.
///
/// Anthropic streams typed events (`content_block_delta`, `message_stop`);
/// OpenAI-compatible endpoints stream `choices[0].delta.content` and close
/// with `[DONE]`. Unknown events are ignored rather than failing the
/// stream.
pub(crate) fn parse_sse_data(data: &str) -> SseDelta {
    if data == "[DONE]" {
        return SseDelta::Done(None);
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseDelta::Ignore,
    };

    // Anthropic dialect.
    match value.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            if let Some(text) = value
                .pointer("/delta/text")
                .and_then(Value::as_str)
            {
                return SseDelta::Text(text.to_owned());
            }
            return SseDelta::Ignore;
        }
        Some("message_stop") => return SseDelta::Done(None),
        Some(_) => return SseDelta::Ignore,
        None => {}
    }

    // OpenAI dialect.
    if let Some(choice) = value.pointer("/choices/0") {
        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
            return SseDelta::Text(text.to_owned());
        }
        if choice
            .get("finish_reason")
            .map(|r| !r.is_null())
            .unwrap_or(false)
        {
            let usage = value
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok());
            return SseDelta::Done(usage);
        }
    }
    SseDelta::Ignore
}

struct SseState {
    body: BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    buffer: String,
    pending: VecDeque<StreamChunk>,
    finished: bool,
    provider: String,
}

/// Turn an SSE response body into a [`ChunkStream`].
///
/// Transport failures mid-stream become a single in-band
/// [`StreamChunk::Error`]; a body that ends without a terminal event is
/// closed with an empty `Done`.
fn sse_chunk_stream(response: reqwest::Response, provider: String) -> ChunkStream {
    let state = SseState {
        body: response.bytes_stream().boxed(),
        buffer: String::new(),
        pending: VecDeque::new(),
        finished: false,
        provider,
    };
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                if matches!(chunk, StreamChunk::Done { .. } | StreamChunk::Error(_)) {
                    st.finished = true;
                    st.pending.clear();
                }
                return Some((chunk, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = st.buffer.find('\n') {
                        let line: String = st.buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if let Some(data) = line.strip_prefix("data:") {
                            match parse_sse_data(data.trim()) {
                                SseDelta::Text(text) => {
                                    st.pending.push_back(StreamChunk::Text(text))
                                }
                                SseDelta::Done(usage) => {
                                    st.pending.push_back(StreamChunk::Done { usage })
                                }
                                SseDelta::Ignore => {}
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    st.pending.push_back(StreamChunk::Error(format!(
                        "{}: stream interrupted: {err}",
                        st.provider
                    )));
                }
                None => {
                    st.pending.push_back(StreamChunk::Done { usage: None });
                }
            }
        }
    }))
}

//─────────────────────────────
//  Anthropic adapter
//─────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Adapter for the Anthropic messages API.
pub struct AnthropicAdapter {
    name: String,
    client: Client,
    keys: KeyRing,
    model: String,
    base_url: Url,
    layer: u8,
    max_tokens: u32,
}

impl AnthropicAdapter {
    /// Create an adapter; refuses to exist without at least one key.
    pub fn new(
        name: &str,
        keys: Vec<Secret<String>>,
        model: &str,
        base_url: Option<&str>,
        layer: u8,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if keys.is_empty() {
            return Err(ProviderError::NoKey {
                provider: name.to_owned(),
            });
        }
        let base_url = Url::parse(base_url.unwrap_or("https://api.anthropic.com")).map_err(|e| {
            ProviderError::InvalidResponse {
                provider: name.to_owned(),
                message: format!("bad base url: {e}"),
            }
        })?;
        let max_tokens = match model {
            "claude-3-5-sonnet-20241022" => 8192,
            _ => 4096,
        };
        debug!(adapter = name, model, layer, "initialized anthropic adapter");
        Ok(Self {
            name: name.to_owned(),
            client: build_client(timeout)?,
            keys: KeyRing::new(keys),
            model: model.to_owned(),
            base_url,
            layer,
            max_tokens,
        })
    }

    fn headers(&self, key: &Secret<String>) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())).map_err(|_| {
                ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: "key contains non-header bytes".into(),
                }
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-version", HeaderValue::from_static("2023-06-01"));
        Ok(headers)
    }

    fn wire_request(&self, request: &ModelRequest, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request
                .max_tokens()
                .unwrap_or(self.max_tokens)
                .min(self.max_tokens),
            messages: vec![WireMessage {
                role: "user".into(),
                content: request.prompt().to_owned(),
            }],
            temperature: request.temperature(),
            stream,
        }
    }

    async fn post(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempts = self.keys.len().max(1);
        loop {
            let key = self.keys.current().ok_or(ProviderError::NoKey {
                provider: self.name.clone(),
            })?;
            let url = self
                .base_url
                .join("/v1/messages")
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: format!("url join: {e}"),
                })?;
            let response = self
                .client
                .post(url)
                .headers(self.headers(key)?)
                .json(&self.wire_request(request, stream))
                .send()
                .await
                .map_err(|e| transport_error(&self.name, e))?;
            match classify_status(&self.name, response).await {
                Ok(ok) => return Ok(ok),
                Err(err) if err.is_rate_limit() && attempts > 1 => {
                    attempts -= 1;
                    warn!(adapter = %self.name, "key rate limited, rotating");
                    self.keys.rotate();
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn layer(&self) -> u8 {
        self.layer
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[instrument(skip(self, request), fields(adapter = %self.name, request_id = %request.request_id))]
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let started = std::time::Instant::now();
        let response = self.post(request, false).await?;
        let wire: AnthropicResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: e.to_string(),
                })?;
        let content = wire
            .content
            .into_iter()
            .find(|c| c.content_type == "text")
            .map(|c| c.text)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: "empty completion".into(),
            });
        }
        check_content_len(&self.name, &content)?;
        Ok(ModelResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: wire.usage.input_tokens,
                completion_tokens: wire.usage.output_tokens,
                total_tokens: wire.usage.input_tokens + wire.usage.output_tokens,
            },
            provider: self.name.clone(),
            model: wire.model,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn generate_stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.post(request, true).await?;
        Ok(sse_chunk_stream(response, self.name.clone()))
    }
}

//─────────────────────────────
//  OpenAI-compatible adapter
//─────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Adapter for any chat-completions-shaped endpoint: the long-context
/// model, the free-tier fallback, and the local shim all speak this wire
/// format. Keys are optional so a local endpoint can run bare.
pub struct OpenAiCompatAdapter {
    name: String,
    client: Client,
    keys: KeyRing,
    model: String,
    base_url: Url,
    layer: u8,
}

impl OpenAiCompatAdapter {
    /// Create an adapter. `require_key` distinguishes hosted endpoints from
    /// the local shim.
    pub fn new(
        name: &str,
        keys: Vec<Secret<String>>,
        model: &str,
        base_url: &str,
        layer: u8,
        timeout: Duration,
        require_key: bool,
    ) -> Result<Self, ProviderError> {
        if require_key && keys.is_empty() {
            return Err(ProviderError::NoKey {
                provider: name.to_owned(),
            });
        }
        let base_url = Url::parse(base_url).map_err(|e| ProviderError::InvalidResponse {
            provider: name.to_owned(),
            message: format!("bad base url: {e}"),
        })?;
        debug!(adapter = name, model, layer, "initialized openai-compatible adapter");
        Ok(Self {
            name: name.to_owned(),
            client: build_client(timeout)?,
            keys: KeyRing::new(keys),
            model: model.to_owned(),
            base_url,
            layer,
        })
    }

    fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = self.keys.current() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())).map_err(
                    |_| ProviderError::InvalidResponse {
                        provider: self.name.clone(),
                        message: "key contains non-header bytes".into(),
                    },
                )?,
            );
        }
        Ok(headers)
    }

    async fn post(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempts = self.keys.len().max(1);
        loop {
            let url = self
                .base_url
                .join("/v1/chat/completions")
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: format!("url join: {e}"),
                })?;
            let wire = OpenAiRequest {
                model: self.model.clone(),
                messages: vec![WireMessage {
                    role: "user".into(),
                    content: request.prompt().to_owned(),
                }],
                max_tokens: request.max_tokens(),
                temperature: request.temperature(),
                stream,
            };
            let response = self
                .client
                .post(url)
                .headers(self.headers()?)
                .json(&wire)
                .send()
                .await
                .map_err(|e| transport_error(&self.name, e))?;
            match classify_status(&self.name, response).await {
                Ok(ok) => return Ok(ok),
                Err(err) if err.is_rate_limit() && attempts > 1 => {
                    attempts -= 1;
                    warn!(adapter = %self.name, "key rate limited, rotating");
                    self.keys.rotate();
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ModelAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn layer(&self) -> u8 {
        self.layer
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[instrument(skip(self, request), fields(adapter = %self.name, request_id = %request.request_id))]
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let started = std::time::Instant::now();
        let response = self.post(request, false).await?;
        let wire: OpenAiResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: self.name.clone(),
                    message: e.to_string(),
                })?;
        let content = wire
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: "empty completion".into(),
            });
        }
        check_content_len(&self.name, &content)?;
        let usage = wire.usage.unwrap_or_default();
        Ok(ModelResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            provider: self.name.clone(),
            model: wire.model,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn generate_stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.post(request, true).await?;
        Ok(sse_chunk_stream(response, self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_openai_dialect() {
        assert_eq!(
            parse_sse_data(r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#),
            SseDelta::Text("hel".into())
        );
        assert_eq!(
            parse_sse_data(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseDelta::Done(None)
        );
        assert_eq!(parse_sse_data("[DONE]"), SseDelta::Done(None));
    }

    #[test]
    fn sse_anthropic_dialect() {
        assert_eq!(
            parse_sse_data(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#
            ),
            SseDelta::Text("lo".into())
        );
        assert_eq!(
            parse_sse_data(r#"{"type":"message_stop"}"#),
            SseDelta::Done(None)
        );
        assert_eq!(
            parse_sse_data(r#"{"type":"ping"}"#),
            SseDelta::Ignore
        );
    }

    #[test]
    fn sse_garbage_is_ignored() {
        assert_eq!(parse_sse_data("not json"), SseDelta::Ignore);
        assert_eq!(parse_sse_data("{}"), SseDelta::Ignore);
    }

    #[test]
    fn key_ring_rotates_and_wraps() {
        let ring = KeyRing::new(vec![
            Secret::new("k1".to_string()),
            Secret::new("k2".to_string()),
        ]);
        assert_eq!(ring.current().unwrap().expose_secret(), "k1");
        ring.rotate();
        assert_eq!(ring.current().unwrap().expose_secret(), "k2");
        ring.rotate();
        assert_eq!(ring.current().unwrap().expose_secret(), "k1");
    }

    #[test]
    fn empty_ring_has_no_current() {
        let ring = KeyRing::new(vec![]);
        assert!(ring.current().is_none());
        ring.rotate(); // harmless
    }
}
