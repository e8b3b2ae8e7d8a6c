//! Queue-bus message envelopes.
//!
//! An envelope is the only type that crosses service boundaries on the bus.
//! It is immutable after publish; identifiers are globally unique; field
//! declaration order doubles as the stable JSON ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::{SosError, SosResult, Subject, TaskPriority, MAX_ENVELOPE_PAYLOAD_LEN};

/// The closed set of message kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Conversational message for an agent.
    Chat,
    /// Imperative instruction.
    Command,
    /// System event notification.
    Event,
    /// Error report.
    Error,
    /// Request to create a task (carries a serialized task).
    TaskCreate,
    /// Completed-task result notification.
    TaskResult,
    /// Request for a capability grant.
    CapabilityRequest,
    /// Daemon liveness beacon.
    Heartbeat,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Command => "command",
            Self::Event => "event",
            Self::Error => "error",
            Self::TaskCreate => "task_create",
            Self::TaskResult => "task_result",
            Self::CapabilityRequest => "capability_request",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

/// Routing and correlation metadata nested inside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Delivery priority hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    /// Correlates request/response pairs across services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Structured payload: kind-specific content plus optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    /// Kind-specific content.
    pub content: Value,
    /// Optional routing metadata.
    #[serde(default, skip_serializing_if = "is_default_metadata")]
    pub metadata: EnvelopeMetadata,
}

fn is_default_metadata(m: &EnvelopeMetadata) -> bool {
    m.priority.is_none() && m.correlation_id.is_none()
}

/// The type that crosses service boundaries on the queue bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Globally unique identifier.
    pub id: Uuid,
    /// Publish timestamp.
    pub ts: DateTime<Utc>,
    /// Message kind.
    pub kind: MessageKind,
    /// Originating subject.
    pub source: Subject,
    /// Target subject or channel name.
    pub target: String,
    /// Structured payload.
    pub payload: EnvelopePayload,
    /// Optional base64 ed25519 signature over the serialized payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl MessageEnvelope {
    /// Build a new envelope with a fresh id and the current timestamp.
    pub fn new(kind: MessageKind, source: Subject, target: &str, content: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            kind,
            source,
            target: target.to_owned(),
            payload: EnvelopePayload {
                content,
                metadata: EnvelopeMetadata::default(),
            },
            signature: None,
        }
    }

    /// Set the delivery priority hint.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.payload.metadata.priority = Some(priority);
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.payload.metadata.correlation_id = Some(correlation_id.to_owned());
        self
    }

    /// The canonical bytes an envelope signature covers.
    pub fn payload_bytes(&self) -> SosResult<Vec<u8>> {
        serde_json::to_vec(&self.payload)
            .map_err(|e| SosError::Internal(format!("payload serialization: {e}")))
    }

    /// Serialize for the wire, enforcing the payload size cap.
    pub fn to_wire(&self) -> SosResult<String> {
        let wire = serde_json::to_string(self)
            .map_err(|e| SosError::Internal(format!("envelope serialization: {e}")))?;
        if wire.len() > MAX_ENVELOPE_PAYLOAD_LEN {
            return Err(SosError::Validation(format!(
                "envelope too large: {} > {MAX_ENVELOPE_PAYLOAD_LEN}",
                wire.len()
            )));
        }
        Ok(wire)
    }

    /// Parse an envelope off the wire.
    pub fn from_wire(raw: &str) -> SosResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SosError::Validation(format!("malformed envelope: {e}")))
    }
}
