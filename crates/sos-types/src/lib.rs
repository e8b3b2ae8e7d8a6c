#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-types** – Shared primitive data structures for the SOS platform.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, cryptography, or storage:
//! the task state machine, worker tiers, agent identities, and message
//! envelopes defined here are pure data plus deterministic transition logic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed size for task descriptions to prevent memory exhaustion.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 16_384;

/// Maximum allowed size for task titles.
pub const MAX_TASK_TITLE_LEN: usize = 256;

/// Maximum allowed size for subject strings (`agent:<name>` / `service:<name>`).
pub const MAX_SUBJECT_LEN: usize = 256;

/// Maximum allowed size for envelope payloads carried over the queue bus.
pub const MAX_ENVELOPE_PAYLOAD_LEN: usize = 1_048_576; // 1MB

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Task lifecycle objects and the transition table.
pub mod task;
/// Worker records and reputation tiers.
pub mod worker;
/// Durable agent identities with lineage.
pub mod identity;
/// Queue-bus message envelopes.
pub mod envelope;

pub use envelope::{EnvelopeMetadata, EnvelopePayload, MessageEnvelope, MessageKind};
pub use identity::{AgentIdentity, Polarity, STATE_VECTOR_DIM};
pub use task::{
    ExecutionStatus, Task, TaskAction, TaskId, TaskPriority, TaskResult, TaskState,
    TransitionRecord,
};
pub use worker::{WorkerId, WorkerRecord, WorkerTier};

/// Convenience module collecting the most commonly used exports so that
/// downstream crates only need a single `use` line.
pub mod prelude {
    pub use super::{
        CapabilityAction, MessageEnvelope, MessageKind, SosError, SosResult, Subject, Task,
        TaskId, TaskPriority, TaskState, WorkerRecord, WorkerTier,
    };
}

//─────────────────────────────
//  Subjects
//─────────────────────────────

/// A platform subject: either an agent (`agent:<name>`) or a service
/// (`service:<name>`).
///
/// Subjects identify the originator of tasks and messages and the grantee
/// of capability tokens. The string form is canonical; this newtype only
/// guards the shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Construct an agent subject (`agent:<name>`).
    pub fn agent(name: &str) -> Self {
        Self(format!("agent:{name}"))
    }

    /// Construct a service subject (`service:<name>`).
    pub fn service(name: &str) -> Self {
        Self(format!("service:{name}"))
    }

    /// Parse and validate a raw subject string.
    pub fn parse(raw: &str) -> Result<Self, SosError> {
        if raw.len() > MAX_SUBJECT_LEN {
            return Err(SosError::Validation(format!(
                "subject too long: {} > {MAX_SUBJECT_LEN}",
                raw.len()
            )));
        }
        match raw.split_once(':') {
            Some(("agent" | "service", name)) if !name.is_empty() => Ok(Self(raw.to_owned())),
            _ => Err(SosError::Validation(format!(
                "subject must be agent:<name> or service:<name>, got {raw:?}"
            ))),
        }
    }

    /// The raw canonical form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare name after the kind prefix.
    pub fn name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// Whether this subject is an agent (as opposed to a service).
    pub fn is_agent(&self) -> bool {
        self.0.starts_with("agent:")
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Subject {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

//─────────────────────────────
//  Capability actions
//─────────────────────────────

/// The closed set of actions a capability token may grant.
///
/// Dispatch over actions is exhaustive everywhere; adding a variant is a
/// compile-visible change across the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityAction {
    /// Read from the external memory service.
    #[serde(rename = "memory:read")]
    MemoryRead,
    /// Write to the external memory service.
    #[serde(rename = "memory:write")]
    MemoryWrite,
    /// Delete from the external memory service.
    #[serde(rename = "memory:delete")]
    MemoryDelete,
    /// Execute a registered tool (gates chat and task submission).
    #[serde(rename = "tool:execute")]
    ToolExecute,
    /// Register a new tool.
    #[serde(rename = "tool:register")]
    ToolRegister,
    /// Read ledger state (gates task listings).
    #[serde(rename = "ledger:read")]
    LedgerRead,
    /// Write ledger state.
    #[serde(rename = "ledger:write")]
    LedgerWrite,
    /// Hatch a new agent identity.
    #[serde(rename = "agent:spawn")]
    AgentSpawn,
    /// Terminate an agent identity.
    #[serde(rename = "agent:terminate")]
    AgentTerminate,
    /// Read service configuration (gates model listings).
    #[serde(rename = "config:read")]
    ConfigRead,
    /// Mutate service configuration.
    #[serde(rename = "config:write")]
    ConfigWrite,
    /// Read an entry from the secrets vault.
    #[serde(rename = "secret:read")]
    SecretRead,
}

impl CapabilityAction {
    /// Canonical wire form, e.g. `memory:read`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryRead => "memory:read",
            Self::MemoryWrite => "memory:write",
            Self::MemoryDelete => "memory:delete",
            Self::ToolExecute => "tool:execute",
            Self::ToolRegister => "tool:register",
            Self::LedgerRead => "ledger:read",
            Self::LedgerWrite => "ledger:write",
            Self::AgentSpawn => "agent:spawn",
            Self::AgentTerminate => "agent:terminate",
            Self::ConfigRead => "config:read",
            Self::ConfigWrite => "config:write",
            Self::SecretRead => "secret:read",
        }
    }
}

impl fmt::Display for CapabilityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityAction {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory:read" => Ok(Self::MemoryRead),
            "memory:write" => Ok(Self::MemoryWrite),
            "memory:delete" => Ok(Self::MemoryDelete),
            "tool:execute" => Ok(Self::ToolExecute),
            "tool:register" => Ok(Self::ToolRegister),
            "ledger:read" => Ok(Self::LedgerRead),
            "ledger:write" => Ok(Self::LedgerWrite),
            "agent:spawn" => Ok(Self::AgentSpawn),
            "agent:terminate" => Ok(Self::AgentTerminate),
            "config:read" => Ok(Self::ConfigRead),
            "config:write" => Ok(Self::ConfigWrite),
            "secret:read" => Ok(Self::SecretRead),
            other => Err(SosError::Validation(format!("unknown action {other:?}"))),
        }
    }
}

//─────────────────────────────
//  Platform error kinds
//─────────────────────────────

/// The platform-wide error kind enumeration.
///
/// Subsystems surface their failures as one of these kinds at the service
/// boundary; the HTTP layer owns the mapping to status codes. Background
/// loops never let these escape to the top level.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SosError {
    /// Malformed input. Surfaced as 400.
    #[error("validation: {0}")]
    Validation(String),
    /// Capability verification failed. 403 in strict mode.
    #[error("authorization: {0}")]
    Authorization(String),
    /// Rate-limit bucket depleted. 429 with Retry-After.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until a token becomes available again.
        retry_after_secs: u64,
    },
    /// A downstream circuit breaker is open. 503.
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    /// Every configured model provider failed. 503.
    #[error("all language model providers failed: {trail}")]
    AllProvidersFailed {
        /// Accumulated per-adapter error trail.
        trail: String,
    },
    /// Task, worker, or resource absent. 404.
    #[error("not found: {0}")]
    NotFound(String),
    /// The task state machine rejected an action. 409.
    #[error("invalid transition: cannot {action} a {state} task")]
    InvalidTransition {
        /// Current state of the task.
        state: TaskState,
        /// The rejected action.
        action: TaskAction,
    },
    /// Unexpected internal failure. 500 with trace id.
    #[error("internal: {0}")]
    Internal(String),
}

/// Platform-wide result alias.
pub type SosResult<T> = std::result::Result<T, SosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_shapes() {
        assert!(Subject::parse("agent:kasra").is_ok());
        assert!(Subject::parse("service:engine").is_ok());
        assert!(Subject::parse("user:nope").is_err());
        assert!(Subject::parse("agent:").is_err());
        assert_eq!(Subject::agent("kasra").name(), "kasra");
        assert!(Subject::agent("kasra").is_agent());
        assert!(!Subject::service("engine").is_agent());
    }

    #[test]
    fn action_round_trips() {
        for raw in [
            "memory:read",
            "memory:write",
            "memory:delete",
            "tool:execute",
            "tool:register",
            "ledger:read",
            "ledger:write",
            "agent:spawn",
            "agent:terminate",
            "config:read",
            "config:write",
            "secret:read",
        ] {
            let action: CapabilityAction = raw.parse().unwrap();
            assert_eq!(action.as_str(), raw);
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{raw}\""));
        }
        assert!("chat:send".parse::<CapabilityAction>().is_err());
    }
}
