#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-engine** – Chat orchestration and the HTTP surface.
//!
//! The engine receives chat messages and decides between answering now
//! (through the model registry) and spawning a task for the worker pool.
//! Every handled chat carries a coherence scalar `omega` derived from
//! response latency; salient exchanges land in external memory with omega
//! attached. The engine also collapses witness waves and proxies the ARF
//! field for the subconscious stream.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod health;
pub mod heuristic;
pub mod http;
pub mod metrics;

pub use heuristic::TaskHeuristic;
pub use http::router;
pub use metrics::EngineMetrics;

use sos_gateway::ModelRequest;
use sos_memory::ArfState;
use sos_runtime::Services;
use sos_types::{SosError, SosResult, Subject, Task, TaskId, TaskPriority};

/// Decay constant for omega; half-life of roughly one second.
pub const OMEGA_LAMBDA: f64 = 0.693;

/// Coherence from response latency: `exp(-lambda * seconds)`.
pub fn omega_for_latency(latency_secs: f64) -> f64 {
    (-OMEGA_LAMBDA * latency_secs).exp()
}

//─────────────────────────────
//  Chat contract
//─────────────────────────────

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// The message text.
    pub message: String,
    /// Originating agent; defaults to the daemon's own identity.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Conversation correlation id.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Explicit request to spawn a task.
    #[serde(default)]
    pub task: Option<bool>,
    /// Capability token carried in-body.
    #[serde(default)]
    pub capability: Option<sos_capability::CapabilityToken>,
}

/// Outcome of a chat: a synchronous answer or an accepted task handle.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ChatOutcome {
    /// Synchronous answer.
    Answer {
        /// Model completion.
        content: String,
        /// Coherence scalar in [0, 1].
        omega: f64,
        /// Trace id for log correlation.
        trace_id: String,
    },
    /// Deferred: a task was spawned.
    Accepted {
        /// The new task id.
        task_id: TaskId,
        /// Always `accepted`.
        status: String,
    },
}

//─────────────────────────────
//  Witness waves
//─────────────────────────────

/// A pending witness wave awaiting collapse.
#[derive(Debug, Clone, Serialize)]
pub struct WitnessWave {
    /// Conversation the wave belongs to.
    pub conversation_id: String,
    /// Agent that produced the exchange.
    pub agent_id: String,
    /// When the wave was opened.
    pub opened_at: DateTime<Utc>,
}

/// Body of `POST /witness`.
#[derive(Debug, Clone, Deserialize)]
pub struct WitnessVote {
    /// Voting agent.
    pub agent_id: String,
    /// Conversation whose wave collapses.
    pub conversation_id: String,
    /// Affirmation (+1) or rejection (-1).
    pub vote: i8,
}

//─────────────────────────────
//  The engine
//─────────────────────────────

/// The chat orchestrator.
pub struct Engine {
    services: Arc<Services>,
    heuristic: TaskHeuristic,
    pending_witness: DashMap<String, WitnessWave>,
    metrics: Arc<EngineMetrics>,
    started_at: Instant,
}

impl Engine {
    /// Build an engine over the services bundle.
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            services,
            heuristic: TaskHeuristic::default(),
            pending_witness: DashMap::new(),
            metrics: Arc::new(EngineMetrics::new()),
            started_at: Instant::now(),
        })
    }

    /// Build with a custom auto-task heuristic.
    pub fn with_heuristic(services: Arc<Services>, heuristic: TaskHeuristic) -> Arc<Self> {
        Arc::new(Self {
            services,
            heuristic,
            pending_witness: DashMap::new(),
            metrics: Arc::new(EngineMetrics::new()),
            started_at: Instant::now(),
        })
    }

    /// The services view this engine was built over.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Engine metrics handle.
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Process uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Handle one chat message: answer now or spawn a task.
    pub async fn handle_chat(&self, request: ChatRequest) -> SosResult<ChatOutcome> {
        if request.message.trim().is_empty() {
            return Err(SosError::Validation("message cannot be empty".into()));
        }
        let agent_id = request
            .agent_id
            .clone()
            .unwrap_or_else(|| self.services.config.agent_id.clone());

        if self.heuristic.should_spawn(&request) {
            return self.spawn_task(&request, &agent_id).await;
        }
        self.answer_now(&request, &agent_id).await
    }

    async fn spawn_task(&self, request: &ChatRequest, agent_id: &str) -> SosResult<ChatOutcome> {
        let title: String = request.message.chars().take(72).collect();
        let mut task = Task::new(
            title.trim(),
            &request.message,
            TaskPriority::Normal,
            Subject::agent(agent_id),
        )?;
        if let Some(conversation_id) = &request.conversation_id {
            task = task.with_conversation(conversation_id);
        }
        let task = self.services.store.create(task).await?;
        self.metrics.tasks_created.inc();
        info!(task = %task.id, agent = agent_id, "chat spawned a task");
        Ok(ChatOutcome::Accepted {
            task_id: task.id,
            status: "accepted".into(),
        })
    }

    async fn answer_now(&self, request: &ChatRequest, agent_id: &str) -> SosResult<ChatOutcome> {
        let trace_id = Uuid::new_v4().to_string();
        let model_request = ModelRequest::new(request.message.clone())
            .map_err(|e| SosError::Validation(e.to_string()))?;

        let started = Instant::now();
        let response = self.services.models.generate(&model_request).await?;
        let latency = started.elapsed().as_secs_f64();
        let omega = omega_for_latency(latency);
        self.metrics.observe_omega(omega);

        // The engine emits omega; interpretation belongs to Mirror.
        if let Some(memory) = &self.services.memory {
            let exchange = format!("user: {}\nassistant: {}", request.message, response.content);
            let metadata = json!({
                "omega": omega,
                "conversation_id": request.conversation_id,
                "trace_id": trace_id,
                "model": response.model,
            });
            if let Err(e) = memory.store_exchange(agent_id, &exchange, metadata).await {
                warn!(error = %e, "failed to store exchange");
            }
        }

        if let Some(conversation_id) = &request.conversation_id {
            self.pending_witness.insert(
                conversation_id.clone(),
                WitnessWave {
                    conversation_id: conversation_id.clone(),
                    agent_id: agent_id.to_owned(),
                    opened_at: Utc::now(),
                },
            );
        }

        debug!(trace_id, latency, omega, "chat answered synchronously");
        Ok(ChatOutcome::Answer {
            content: response.content,
            omega,
            trace_id,
        })
    }

    /// Collapse pending witness waves for a vote's conversation.
    ///
    /// Any pending wave for the conversation collapses regardless of vote
    /// direction; the direction is recorded for the bus observers.
    pub async fn witness(&self, vote: WitnessVote) -> SosResult<usize> {
        if vote.vote != 1 && vote.vote != -1 {
            return Err(SosError::Validation(format!(
                "vote must be -1 or 1, got {}",
                vote.vote
            )));
        }
        let collapsed = self
            .pending_witness
            .remove(&vote.conversation_id)
            .map(|_| 1)
            .unwrap_or(0);
        let channel = format!("agent:{}:events", vote.agent_id);
        let envelope = sos_types::MessageEnvelope::new(
            sos_types::MessageKind::Event,
            Subject::agent(&vote.agent_id),
            &channel,
            json!({
                "event": "witness_collapse",
                "conversation_id": vote.conversation_id,
                "vote": vote.vote,
                "collapsed": collapsed,
            }),
        );
        if let Err(e) = self.services.bus.publish(&channel, &envelope).await {
            warn!(error = %e, "failed to publish witness collapse");
        }
        Ok(collapsed)
    }

    /// Count of waves currently pending collapse.
    pub fn pending_witness_count(&self) -> usize {
        self.pending_witness.len()
    }

    /// Current ARF state proxied from Mirror; a quiet default when no
    /// memory service is deployed.
    pub async fn arf_state(&self) -> ArfState {
        match &self.services.memory {
            Some(memory) => memory.arf_state().await.unwrap_or(ArfState {
                alpha_drift: 0.0,
                regime: "unreachable".into(),
            }),
            None => ArfState {
                alpha_drift: 0.0,
                regime: "unconfigured".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omega_matches_the_decay_law() {
        // Property 5: omega == exp(-0.693 * latency).
        for latency in [0.0, 0.25, 1.0, 2.5, 30.0] {
            let expected = (-0.693f64 * latency).exp();
            assert!((omega_for_latency(latency) - expected).abs() < 1e-12);
        }
        // Half-life of one second.
        assert!((omega_for_latency(1.0) - 0.5).abs() < 0.01);
        assert!(omega_for_latency(0.0) <= 1.0);
    }
}
