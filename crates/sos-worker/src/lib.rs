#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-worker** – The work-queue consumer.
//!
//! A worker reads the global task stream through a consumer group, hands
//! each task to its executor, and reports the result to the engine over
//! HTTP. Failure policy per the platform contract: an executor error acks
//! the stream entry and records a worker failure but never transitions the
//! task (maintenance will reap it, or a later submit will land); a submit
//! transport failure retries with exponential backoff and finally acks to
//! avoid redelivery storms.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use sos_gateway::{LayerPreference, ModelRequest};
use sos_runtime::Services;
use sos_types::{ExecutionStatus, SosError, TaskId, TaskPriority};

/// Consumer group every worker joins on the global queue.
pub const CONSUMER_GROUP: &str = "sos-workers";

/// Submit attempts before giving up and acking.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 5;

/// Stream entries fetched per read.
const READ_BATCH: usize = 8;

/// Block duration for one stream read.
const READ_BLOCK: Duration = Duration::from_secs(5);

//─────────────────────────────
//  Payloads and executors
//─────────────────────────────

/// Task payload carried on the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Task identifier.
    pub task_id: TaskId,
    /// Short title.
    pub title: String,
    /// Full description the executor works from.
    pub description: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
}

/// What an executor produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// The produced output.
    pub output: String,
    /// Model that produced it.
    pub model_used: String,
    /// Verdict.
    pub status: ExecutionStatus,
}

/// An executor turns a task payload into output.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one task.
    async fn execute(&self, payload: &TaskPayload) -> Result<ExecutionOutput>;
}

/// The default executor: prompts the model registry with the task
/// description, preferring cheap layers to respect cost constraints.
pub struct ModelExecutor {
    services: Arc<Services>,
}

impl ModelExecutor {
    /// Build over the services bundle.
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Executor for ModelExecutor {
    async fn execute(&self, payload: &TaskPayload) -> Result<ExecutionOutput> {
        let prompt = format!(
            "You are an autonomous worker executing a task.\n\
             Task: {}\n\n{}\n\nProduce the complete result.",
            payload.title, payload.description
        );
        let request = ModelRequest::new(prompt).context("build executor prompt")?;
        let response = self
            .services
            .models
            .generate_with(&request, LayerPreference::CheapFirst)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(ExecutionOutput {
            output: response.content,
            model_used: response.model,
            status: ExecutionStatus::Success,
        })
    }
}

//─────────────────────────────
//  The worker
//─────────────────────────────

/// The queue consumer.
pub struct Worker {
    services: Arc<Services>,
    executor: Arc<dyn Executor>,
    worker_id: String,
    submit_base: String,
    capability: Option<String>,
    http: reqwest::Client,
}

impl Worker {
    /// Build a worker submitting to the engine at the configured bind
    /// address.
    pub fn new(services: Arc<Services>, executor: Arc<dyn Executor>, worker_id: &str) -> Result<Self> {
        let submit_base = format!("http://{}", services.config.bind_addr);
        Self::with_submit_base(services, executor, worker_id, &submit_base)
    }

    /// Build a worker submitting to an explicit engine base URL.
    pub fn with_submit_base(
        services: Arc<Services>,
        executor: Arc<dyn Executor>,
        worker_id: &str,
        submit_base: &str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build submit client")?;
        Ok(Self {
            services,
            executor,
            worker_id: worker_id.to_owned(),
            submit_base: submit_base.trim_end_matches('/').to_owned(),
            capability: None,
            http,
        })
    }

    /// Attach a pre-encoded capability header value for strict engines.
    pub fn with_capability(mut self, encoded_token: &str) -> Self {
        self.capability = Some(encoded_token.to_owned());
        self
    }

    /// The worker's identifier.
    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Consume until the stop signal flips.
    ///
    /// `ready` fires once the consumer group exists and reads can begin;
    /// startup sequencing uses it to order worker-start before the first
    /// claim publish.
    pub async fn run(
        &self,
        mut stop: watch::Receiver<bool>,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let queue = self.services.config.worker_queue.clone();
        self.services
            .registry
            .register(&self.worker_id, &self.worker_id)
            .await?;
        self.services
            .bus
            .ensure_group(&queue, CONSUMER_GROUP)
            .await
            .map_err(SosError::from)?;
        if let Some(ready) = ready {
            let _ = ready.send(());
        }
        info!(worker = %self.worker_id, queue = %queue, "worker consuming");

        loop {
            if *stop.borrow() {
                break;
            }
            let read = tokio::select! {
                _ = stop.changed() => continue,
                read = self.services.bus.stream_read_group(
                    &queue,
                    CONSUMER_GROUP,
                    &self.worker_id,
                    READ_BATCH,
                    READ_BLOCK,
                ) => read,
            };
            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "stream read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            for entry in entries {
                self.process_entry(&queue, &entry.entry_id, &entry.envelope)
                    .await;
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn process_entry(
        &self,
        queue: &str,
        entry_id: &str,
        envelope: &sos_types::MessageEnvelope,
    ) {
        // Opportunistic: unsigned envelopes pass, forged ones do not.
        if let Err(e) = self.services.verifier.verify_envelope(envelope) {
            warn!(entry_id, error = %e, "envelope failed verification, acking");
            self.ack(queue, entry_id).await;
            return;
        }
        let payload: TaskPayload = match serde_json::from_value(envelope.payload.content.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(entry_id, error = %e, "undecodable task payload, acking");
                self.ack(queue, entry_id).await;
                return;
            }
        };
        debug!(task = %payload.task_id, worker = %self.worker_id, "executing task");

        if !self.services.config.auto_execute_enabled {
            debug!("auto-execute disabled, acking without work");
            self.ack(queue, entry_id).await;
            return;
        }

        let timeout = self.services.config.worker_timeout;
        let outcome = tokio::time::timeout(timeout, self.executor.execute(&payload)).await;
        match outcome {
            Ok(Ok(output)) => {
                self.submit_with_retry(&payload.task_id, &output).await;
                self.ack(queue, entry_id).await;
            }
            Ok(Err(e)) => {
                // Executor failed: ack, record, never transition the task.
                warn!(task = %payload.task_id, error = %e, "executor failed");
                self.ack(queue, entry_id).await;
                if let Err(e) = self.services.registry.record_failure(&self.worker_id).await {
                    warn!(error = %e, "failure bookkeeping failed");
                }
            }
            Err(_) => {
                warn!(task = %payload.task_id, ?timeout, "executor timed out");
                self.ack(queue, entry_id).await;
                if let Err(e) = self.services.registry.record_failure(&self.worker_id).await {
                    warn!(error = %e, "failure bookkeeping failed");
                }
            }
        }
    }

    async fn ack(&self, queue: &str, entry_id: &str) {
        if let Err(e) = self
            .services
            .bus
            .stream_ack(queue, CONSUMER_GROUP, entry_id)
            .await
        {
            warn!(entry_id, error = %e, "stream ack failed");
        }
    }

    /// POST the result to `/tasks/{id}/submit`, retrying with exponential
    /// backoff; after the last attempt the failure is logged and swallowed
    /// so the stream entry can still be acked.
    async fn submit_with_retry(&self, task_id: &TaskId, output: &ExecutionOutput) {
        let url = format!("{}/tasks/{}/submit", self.submit_base, task_id);
        let body = serde_json::json!({
            "output": output.output,
            "model_used": output.model_used,
            "status": output.status,
            "worker_id": self.worker_id,
        });
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            let mut request = self.http.post(&url).json(&body);
            if let Some(capability) = &self.capability {
                request = request.header("x-sos-capability", capability);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(task = %task_id, attempt, "result submitted");
                    return;
                }
                Ok(response) if response.status().is_client_error() => {
                    // 4xx will not improve with retries (conflict, gone).
                    warn!(task = %task_id, status = %response.status(), "submit rejected");
                    return;
                }
                Ok(response) => {
                    warn!(task = %task_id, attempt, status = %response.status(), "submit failed");
                }
                Err(e) => {
                    warn!(task = %task_id, attempt, error = %e, "submit transport error");
                }
            }
            if attempt < MAX_SUBMIT_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1u64 << (attempt - 1))).await;
            }
        }
        error!(task = %task_id, attempts = MAX_SUBMIT_ATTEMPTS, "submit exhausted, giving up");
    }
}
