#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-gateway** – Multi-provider model gateway for the SOS platform.
//!
//! The gateway presents a single `generate` / `generate_stream` interface to
//! the engine and the workers. Behind it sits a prioritized set of adapters,
//! one per external provider, each holding a ring of API keys. Failover is
//! layered: adapters are tried in ascending layer order, a per-adapter
//! circuit breaker isolates failing providers, and per-key rotation absorbs
//! per-key rate limits before an adapter gives up.
//!
//! Providers fail independently and asymmetrically; one provider's rate
//! limit is often another's sunny day. The fallback loop is a fold over
//! [`ProviderError`] values, never exception-driven control flow.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod adapters;
pub mod config;
pub mod registry;

pub use adapters::{AnthropicAdapter, ModelAdapter, OpenAiCompatAdapter};
pub use config::GatewayConfig;
pub use registry::{AdapterStatus, LayerPreference, ModelRegistry};

/// Maximum allowed prompt length to prevent memory exhaustion.
pub const MAX_PROMPT_LENGTH: usize = 131_072; // 128KB

/// Maximum allowed response length to prevent memory exhaustion.
pub const MAX_RESPONSE_LENGTH: usize = 1_048_576; // 1MB

/// Default per-call timeout for model providers.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

//─────────────────────────────
//  Requests and responses
//─────────────────────────────

/// A text-generation request with validation applied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    prompt: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    /// Request id threaded through logs and the error trail.
    pub request_id: String,
}

impl ModelRequest {
    /// Create a request, rejecting empty or oversized prompts.
    pub fn new(prompt: impl Into<String>) -> anyhow::Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            anyhow::bail!("prompt cannot be empty");
        }
        if prompt.len() > MAX_PROMPT_LENGTH {
            anyhow::bail!(
                "prompt too long: {} > {} characters",
                prompt.len(),
                MAX_PROMPT_LENGTH
            );
        }
        Ok(Self {
            prompt,
            max_tokens: None,
            temperature: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Cap the response length in tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set sampling temperature (0.0 = deterministic).
    pub fn with_temperature(mut self, temperature: f32) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&temperature) {
            anyhow::bail!("temperature must be within 0.0..=1.0, got {temperature}");
        }
        self.temperature = Some(temperature);
        Ok(self)
    }

    /// The prompt text.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Requested response cap, if any.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// Requested temperature, if any.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }
}

/// Token usage statistics for cost tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text.
    pub content: String,
    /// Usage statistics as reported by the provider.
    pub usage: TokenUsage,
    /// Provider that answered (adapter name).
    pub provider: String,
    /// Concrete model that answered.
    pub model: String,
    /// Wall-clock latency in milliseconds.
    pub duration_ms: u64,
}

/// One element of a generation stream.
///
/// A failing stream terminates with a single in-band [`StreamChunk::Error`];
/// chunks already emitted are never replayed by fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum StreamChunk {
    /// A piece of generated text.
    Text(String),
    /// Successful end of stream with final usage, when reported.
    Done {
        /// Usage totals, if the provider reported them.
        usage: Option<TokenUsage>,
    },
    /// In-band error marker; always the final element.
    Error(String),
}

/// A lazily evaluated sequence of stream chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

//─────────────────────────────
//  Provider errors
//─────────────────────────────

/// Classified failure from one provider call.
///
/// The registry folds over these: rate limits rotate keys, everything else
/// charges the adapter's breaker and falls through to the next layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Provider returned a rate-limit response (HTTP 429 or equivalent).
    #[error("{provider}: rate limited")]
    RateLimited {
        /// Adapter name.
        provider: String,
    },
    /// Transport-level failure (connect, timeout, TLS).
    #[error("{provider}: network error: {message}")]
    Network {
        /// Adapter name.
        provider: String,
        /// Transport error description.
        message: String,
    },
    /// Provider-side failure (HTTP 5xx or 4xx other than 429).
    #[error("{provider}: server error {status}: {message}")]
    Server {
        /// Adapter name.
        provider: String,
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        message: String,
    },
    /// Response arrived but could not be interpreted.
    #[error("{provider}: invalid response: {message}")]
    InvalidResponse {
        /// Adapter name.
        provider: String,
        /// Parse failure description.
        message: String,
    },
    /// Adapter has no usable key configured.
    #[error("{provider}: no API key configured")]
    NoKey {
        /// Adapter name.
        provider: String,
    },
}

impl ProviderError {
    /// Whether this is the rate-limit class that key rotation absorbs.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
