//! Task lifecycle objects.
//!
//! A [`Task`] is a unit of deferred work. Its state machine is fixed:
//!
//! ```text
//! pending → claimed → in_progress → review → completed | rejected
//!              ↓            ↓                     rejected → pending
//!           pending     abandoned                abandoned → pending
//! ```
//!
//! The transition table lives here, next to the data, so the store, the
//! engine, and the maintenance loop all agree on what is legal. Transition
//! *enforcement* (locking, durability) belongs to `sos-task-store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{SosError, SosResult, Subject, MAX_TASK_DESCRIPTION_LEN, MAX_TASK_TITLE_LEN};

//─────────────────────────────
//  Identifiers and enums
//─────────────────────────────

/// Unique task identifier; doubles as the on-disk file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SosError::Validation(format!("bad task id {s:?}: {e}")))
    }
}

/// Scheduling priority. Ordering is total: `Critical > High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Time-sensitive work.
    High,
    /// Preempts everything else in the queue.
    Critical,
}

/// Lifecycle states. `Completed`, `Rejected`, and `Abandoned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Awaiting a claim.
    Pending,
    /// Claimed by a worker, not yet started.
    Claimed,
    /// Being executed.
    InProgress,
    /// Result submitted, awaiting approval.
    Review,
    /// Approved. Terminal success.
    Completed,
    /// Rejected in review. Terminal (reopenable).
    Rejected,
    /// Given up. Terminal (reopenable).
    Abandoned,
}

impl TaskState {
    /// Whether the state admits no further execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Abandoned)
    }

    /// Whether the state is the terminal *success* state.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Canonical lowercase label, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }

    /// The state reached by applying `action`, or `InvalidTransition`.
    pub fn apply(&self, action: TaskAction) -> SosResult<TaskState> {
        use TaskAction::*;
        use TaskState::*;
        let next = match (self, action) {
            (Pending, Claim) => Claimed,
            (Claimed, Start) => InProgress,
            (Claimed, Unclaim) => Pending,
            (InProgress, Submit) => Review,
            (InProgress, Abandon) => Abandoned,
            (Review, Approve) => Completed,
            (Review, Reject) => Rejected,
            (Rejected, Reopen) => Pending,
            (Abandoned, Reopen) => Pending,
            (state, action) => {
                return Err(SosError::InvalidTransition {
                    state: *state,
                    action,
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(SosError::Validation(format!("unknown state {other:?}"))),
        }
    }
}

/// The closed set of state-machine actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// `pending → claimed`.
    Claim,
    /// `claimed → in_progress`.
    Start,
    /// `claimed → pending`.
    Unclaim,
    /// `in_progress → review`.
    Submit,
    /// `in_progress → abandoned`.
    Abandon,
    /// `review → completed`.
    Approve,
    /// `review → rejected`.
    Reject,
    /// `rejected | abandoned → pending`.
    Reopen,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Start => "start",
            Self::Unclaim => "unclaim",
            Self::Submit => "submit",
            Self::Abandon => "abandon",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Reopen => "reopen",
        };
        f.write_str(s)
    }
}

//─────────────────────────────
//  Results and history
//─────────────────────────────

/// Outcome reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Executor produced a usable output.
    Success,
    /// Executor ran but the work failed.
    Failure,
}

/// Result object attached to a task after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Executor output (model completion, tool output, ...).
    pub output: String,
    /// Identifier of the model that produced the output.
    pub model_used: String,
    /// Whether the executor considered the run successful.
    pub status: ExecutionStatus,
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: TaskState,
    /// State after the transition.
    pub to: TaskState,
    /// The action that caused it.
    pub action: TaskAction,
    /// Who performed it (worker id, subject, or `maintenance`).
    pub actor: String,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Optional free-form reason (e.g. `claim timeout`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

//─────────────────────────────
//  Task
//─────────────────────────────

/// A unit of deferred work.
///
/// Field order is the stable JSON serialization order. Timestamps obey
/// `claimed_at >= created_at` and `completed_at >= claimed_at` whenever set;
/// `reported` may only be true in the terminal success state. Those
/// invariants are maintained by the store, which owns all mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Short human-readable title.
    pub title: String,
    /// Full description handed to the executor.
    pub description: String,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Subject that originated the task.
    pub origin: Subject,
    /// Conversation the task was spawned from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the task is claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set when the task reaches terminal success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker currently holding the claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    /// Optional bounty in integer micro-units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounty: Option<u64>,
    /// Result attached at submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Whether the report loop has notified the originating adapter.
    #[serde(default)]
    pub reported: bool,
    /// Append-only transition history.
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Task {
    /// Create a new `pending` task with validation.
    pub fn new(title: &str, description: &str, priority: TaskPriority, origin: Subject) -> SosResult<Self> {
        if title.trim().is_empty() {
            return Err(SosError::Validation("task title cannot be empty".into()));
        }
        if title.len() > MAX_TASK_TITLE_LEN {
            return Err(SosError::Validation(format!(
                "task title too long: {} > {MAX_TASK_TITLE_LEN}",
                title.len()
            )));
        }
        // Empty descriptions are creatable; the chat heuristic just never
        // auto-spawns one.
        if description.len() > MAX_TASK_DESCRIPTION_LEN {
            return Err(SosError::Validation(format!(
                "task description too long: {} > {MAX_TASK_DESCRIPTION_LEN}",
                description.len()
            )));
        }
        Ok(Self {
            id: TaskId::new(),
            title: title.to_owned(),
            description: description.to_owned(),
            priority,
            state: TaskState::Pending,
            origin,
            conversation_id: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
            assigned_worker: None,
            bounty: None,
            result: None,
            reported: false,
            history: Vec::new(),
        })
    }

    /// Attach the originating conversation.
    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_owned());
        self
    }

    /// Attach a bounty in micro-units.
    pub fn with_bounty(mut self, bounty: u64) -> Self {
        self.bounty = Some(bounty);
        self
    }

    /// How long the task has sat in its current state, judged by the last
    /// history record (or creation for a fresh task).
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        let since = self
            .history
            .last()
            .map(|h| h.at)
            .unwrap_or(self.created_at);
        now - since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn origin() -> Subject {
        Subject::agent("kasra")
    }

    #[test]
    fn happy_path_through_state_machine() {
        let mut state = TaskState::Pending;
        for action in [
            TaskAction::Claim,
            TaskAction::Start,
            TaskAction::Submit,
            TaskAction::Approve,
        ] {
            state = state.apply(action).unwrap();
        }
        assert_eq!(state, TaskState::Completed);
        assert!(state.is_terminal_success());
    }

    #[test]
    fn terminal_states_reject_forward_actions() {
        for terminal in [TaskState::Completed, TaskState::Rejected, TaskState::Abandoned] {
            assert!(terminal.is_terminal());
            let err = terminal.apply(TaskAction::Claim).unwrap_err();
            assert!(matches!(err, SosError::InvalidTransition { .. }));
        }
        // Rejected and abandoned may reopen; completed may not.
        assert_eq!(
            TaskState::Rejected.apply(TaskAction::Reopen).unwrap(),
            TaskState::Pending
        );
        assert_eq!(
            TaskState::Abandoned.apply(TaskAction::Reopen).unwrap(),
            TaskState::Pending
        );
        assert!(TaskState::Completed.apply(TaskAction::Reopen).is_err());
    }

    #[test]
    fn empty_description_is_creatable() {
        let task = Task::new("list files", "", TaskPriority::Normal, origin()).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.description.is_empty());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn task_json_round_trip() {
        let task = Task::new("t", "do the thing", TaskPriority::High, origin())
            .unwrap()
            .with_conversation("conv-1")
            .with_bounty(1_500_000);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    proptest! {
        // Property 2: any sequence of applied actions yields a path the
        // transition table accepts; illegal actions never change state.
        #[test]
        fn transitions_stay_on_valid_paths(actions in proptest::collection::vec(0u8..8, 0..32)) {
            let all = [
                TaskAction::Claim, TaskAction::Start, TaskAction::Unclaim,
                TaskAction::Submit, TaskAction::Abandon, TaskAction::Approve,
                TaskAction::Reject, TaskAction::Reopen,
            ];
            let mut state = TaskState::Pending;
            for idx in actions {
                let action = all[idx as usize];
                match state.apply(action) {
                    Ok(next) => {
                        // Cross-check against the explicit edge list.
                        let legal = matches!(
                            (state, action),
                            (TaskState::Pending, TaskAction::Claim)
                                | (TaskState::Claimed, TaskAction::Start)
                                | (TaskState::Claimed, TaskAction::Unclaim)
                                | (TaskState::InProgress, TaskAction::Submit)
                                | (TaskState::InProgress, TaskAction::Abandon)
                                | (TaskState::Review, TaskAction::Approve)
                                | (TaskState::Review, TaskAction::Reject)
                                | (TaskState::Rejected, TaskAction::Reopen)
                                | (TaskState::Abandoned, TaskAction::Reopen)
                        );
                        prop_assert!(legal, "table accepted illegal edge {state:?} --{action:?}--> {next:?}");
                        state = next;
                    }
                    Err(SosError::InvalidTransition { state: s, action: a }) => {
                        prop_assert_eq!(s, state);
                        prop_assert_eq!(a, action);
                    }
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                }
            }
        }
    }
}
