#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-memory** – Client for the external Mirror memory service.
//!
//! Mirror owns embeddings, semantic search, and the ARF coherence field;
//! this crate only speaks its HTTP contract. The [`MemoryStore`] trait is
//! the seam the engine and daemon depend on, so tests can swap in a stub
//! without a network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Default timeout for memory store calls.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for health probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Kinds of memory the platform writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// A stored chat exchange.
    Exchange,
    /// A bus-activity observation from the pulse loop.
    Observation,
    /// A synthesized insight from the dream loop.
    Dream,
}

/// One memory record as Mirror returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Mirror-assigned identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Record kind.
    pub kind: MemoryKind,
    /// Stored content.
    pub content: String,
    /// Embedding vector, present when Mirror has computed one.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Free-form metadata (`omega`, `conversation_id`, ...).
    #[serde(default)]
    pub metadata: Value,
    /// Ids of records this one references (dream cluster members).
    #[serde(default)]
    pub references: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// The ARF coherence field snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArfState {
    /// Rate of change of coherence; |drift| > threshold triggers dreams.
    pub alpha_drift: f64,
    /// Named regime Mirror currently reports.
    pub regime: String,
}

/// Failures from the memory service.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Transport failure (connect, timeout).
    #[error("memory transport: {0}")]
    Transport(String),
    /// Non-success status from Mirror.
    #[error("memory service returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Body excerpt.
        message: String,
    },
    /// Unintelligible response body.
    #[error("memory decode: {0}")]
    Decode(String),
}

impl From<MemoryError> for sos_types::SosError {
    fn from(err: MemoryError) -> Self {
        sos_types::SosError::Internal(err.to_string())
    }
}

/// Result alias for memory calls.
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// The seam the engine and daemon depend on.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a chat exchange with its omega metadata.
    async fn store_exchange(
        &self,
        agent_id: &str,
        content: &str,
        metadata: Value,
    ) -> MemoryResult<String>;

    /// Store a pulse-loop observation.
    async fn store_observation(&self, agent_id: &str, content: &str) -> MemoryResult<String>;

    /// Store a dream referencing its cluster members.
    async fn store_dream(
        &self,
        agent_id: &str,
        content: &str,
        references: &[String],
    ) -> MemoryResult<String>;

    /// Most recent memories for an agent, newest first, embeddings included.
    async fn recent_memories(&self, agent_id: &str, limit: usize)
        -> MemoryResult<Vec<MemoryRecord>>;

    /// Current ARF field state.
    async fn arf_state(&self) -> MemoryResult<ArfState>;

    /// Liveness probe with the short health timeout.
    async fn healthy(&self) -> bool;
}

//─────────────────────────────
//  HTTP implementation
//─────────────────────────────

fn refs_empty(refs: &&[String]) -> bool {
    refs.is_empty()
}

#[derive(Debug, Serialize)]
struct StoreRequest<'a> {
    agent_id: &'a str,
    kind: MemoryKind,
    content: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    metadata: Value,
    #[serde(skip_serializing_if = "refs_empty")]
    references: &'a [String],
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    memories: Vec<MemoryRecord>,
}

/// HTTP client for a Mirror deployment.
pub struct MirrorClient {
    client: reqwest::Client,
    health_client: reqwest::Client,
    base_url: Url,
}

impl MirrorClient {
    /// Connect to Mirror at `base_url`.
    pub fn new(base_url: &str) -> MemoryResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| MemoryError::Transport(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(STORE_TIMEOUT)
            .user_agent(concat!("sos-memory/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        let health_client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            health_client,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> MemoryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| MemoryError::Transport(e.to_string()))
    }

    async fn check(response: reqwest::Response) -> MemoryResult<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MemoryError::Status {
                status: status.as_u16(),
                message: message.chars().take(256).collect(),
            });
        }
        Ok(response)
    }

    #[instrument(skip(self, request), fields(agent = request.agent_id, kind = ?request.kind))]
    async fn store(&self, request: StoreRequest<'_>) -> MemoryResult<String> {
        let response = self
            .client
            .post(self.endpoint("/memories")?)
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        let stored: StoreResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::Decode(e.to_string()))?;
        debug!(id = %stored.id, "memory stored");
        Ok(stored.id)
    }
}

#[async_trait]
impl MemoryStore for MirrorClient {
    async fn store_exchange(
        &self,
        agent_id: &str,
        content: &str,
        metadata: Value,
    ) -> MemoryResult<String> {
        self.store(StoreRequest {
            agent_id,
            kind: MemoryKind::Exchange,
            content,
            metadata,
            references: &[],
        })
        .await
    }

    async fn store_observation(&self, agent_id: &str, content: &str) -> MemoryResult<String> {
        self.store(StoreRequest {
            agent_id,
            kind: MemoryKind::Observation,
            content,
            metadata: Value::Null,
            references: &[],
        })
        .await
    }

    async fn store_dream(
        &self,
        agent_id: &str,
        content: &str,
        references: &[String],
    ) -> MemoryResult<String> {
        self.store(StoreRequest {
            agent_id,
            kind: MemoryKind::Dream,
            content,
            metadata: Value::Null,
            references,
        })
        .await
    }

    async fn recent_memories(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        let mut url = self.endpoint("/memories")?;
        url.query_pairs_mut()
            .append_pair("agent_id", agent_id)
            .append_pair("limit", &limit.to_string())
            .append_pair("embeddings", "true");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        let list: ListResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::Decode(e.to_string()))?;
        Ok(list.memories)
    }

    async fn arf_state(&self) -> MemoryResult<ArfState> {
        let response = self
            .client
            .get(self.endpoint("/arf")?)
            .send()
            .await
            .map_err(|e| MemoryError::Transport(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MemoryError::Decode(e.to_string()))
    }

    async fn healthy(&self) -> bool {
        let Ok(url) = self.endpoint("/health") else {
            return false;
        };
        match self.health_client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
