#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-task-store** – Durable file-per-task repository.
//!
//! Each task lives in `<root>/<task_id>.json`. Every mutation is a
//! read-modify-write that lands via write-to-temp followed by rename, so a
//! crash can never leave a half-written record and concurrent claimers race
//! safely: exactly one wins, the rest observe the new state and back off.
//! The rename *is* the concurrency primitive; in-process callers are
//! additionally serialized per task so the read-modify-write itself cannot
//! interleave.
//!
//! The state machine itself lives in `sos-types`; this crate enforces it,
//! stamps timestamps, and appends history records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sos_types::{
    SosError, SosResult, Task, TaskAction, TaskId, TaskResult, TaskState, TransitionRecord,
};

/// Timeouts the maintenance loop enforces, per §state durations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// `claimed` longer than this is auto-unclaimed.
    pub claim_timeout: Duration,
    /// `in_progress` longer than this is auto-abandoned.
    pub progress_timeout: Duration,
    /// `review` longer than this is escalated (never auto-transitioned).
    pub review_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::hours(24),
            progress_timeout: Duration::hours(168),
            review_timeout: Duration::hours(48),
        }
    }
}

/// What a maintenance sweep did and what it wants escalated.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MaintenanceReport {
    /// Tasks returned to `pending` with reason "claim timeout".
    pub unclaimed: Vec<TaskId>,
    /// Tasks force-abandoned after a week in progress.
    pub abandoned: Vec<TaskId>,
    /// Tasks stuck in review; caller publishes an escalation event.
    pub escalated: Vec<TaskId>,
}

/// The file-per-task repository.
///
/// The store is the exclusive owner of task records on disk; everything
/// else holds read snapshots.
pub struct TaskStore {
    root: PathBuf,
    locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl TaskStore {
    /// Open (creating if absent) a store rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> SosResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SosError::Internal(format!("create task root: {e}")))?;
        info!(root = %root.display(), "task store opened");
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn lock_for(&self, id: TaskId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write-to-temp then rename; the rename is what makes state
    /// transitions atomic across processes.
    async fn persist(&self, task: &Task) -> SosResult<()> {
        let bytes = serde_json::to_vec_pretty(task)
            .map_err(|e| SosError::Internal(format!("serialize task: {e}")))?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", task.id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SosError::Internal(format!("write temp: {e}")))?;
        tokio::fs::rename(&tmp, self.path_for(task.id))
            .await
            .map_err(|e| SosError::Internal(format!("rename into place: {e}")))?;
        Ok(())
    }

    async fn load(&self, id: TaskId) -> SosResult<Task> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SosError::NotFound(format!("task {id}")))
            }
            Err(e) => return Err(SosError::Internal(format!("read task: {e}"))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| SosError::Internal(format!("corrupt task file {id}: {e}")))
    }

    //─────────────────────────────
    //  Creation and reads
    //─────────────────────────────

    /// Persist a freshly created task. The task must be `pending`.
    pub async fn create(&self, task: Task) -> SosResult<Task> {
        if task.state != TaskState::Pending {
            return Err(SosError::Validation(format!(
                "new tasks must be pending, got {}",
                task.state
            )));
        }
        self.persist(&task).await?;
        debug!(task = %task.id, title = %task.title, "task created");
        Ok(task)
    }

    /// Read one task.
    pub async fn get(&self, id: TaskId) -> SosResult<Task> {
        self.load(id).await
    }

    /// Enumerate tasks, optionally filtered by state.
    ///
    /// Directory listing is the enumeration; ordering is by creation time.
    pub async fn list(&self, state: Option<TaskState>) -> SosResult<Vec<Task>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SosError::Internal(format!("list task root: {e}")))?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SosError::Internal(format!("read dir entry: {e}")))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".json") else {
                continue; // temp files and strays
            };
            let Ok(id) = stem.parse::<TaskId>() else {
                continue;
            };
            match self.load(id).await {
                Ok(task) => {
                    if state.map(|s| task.state == s).unwrap_or(true) {
                        tasks.push(task);
                    }
                }
                // A record replaced mid-listing is fine; skip and move on.
                Err(SosError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(task = %id, error = %e, "skipping unreadable task record");
                }
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    //─────────────────────────────
    //  Transitions
    //─────────────────────────────

    /// Apply one state-machine action under the task's write lock.
    async fn transition(
        &self,
        id: TaskId,
        action: TaskAction,
        actor: &str,
        reason: Option<&str>,
        mutate: impl FnOnce(&mut Task),
    ) -> SosResult<Task> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut task = self.load(id).await?;
        let from = task.state;
        task.state = from.apply(action)?;
        task.history.push(TransitionRecord {
            from,
            to: task.state,
            action,
            actor: actor.to_owned(),
            at: Utc::now(),
            reason: reason.map(str::to_owned),
        });
        mutate(&mut task);
        self.persist(&task).await?;
        debug!(task = %id, %from, to = %task.state, %action, actor, "transition applied");
        Ok(task)
    }

    /// Claim a pending task for `worker_id`.
    ///
    /// Idempotent per (task, worker): re-claiming a task you already hold
    /// returns the current record. Any other non-pending state is an
    /// `InvalidTransition`.
    pub async fn claim(&self, id: TaskId, worker_id: &str) -> SosResult<Task> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut task = self.load(id).await?;
        if task.state == TaskState::Claimed && task.assigned_worker.as_deref() == Some(worker_id) {
            return Ok(task);
        }
        let from = task.state;
        task.state = from.apply(TaskAction::Claim)?;
        let now = Utc::now();
        task.claimed_at = Some(now.max(task.created_at));
        task.assigned_worker = Some(worker_id.to_owned());
        task.history.push(TransitionRecord {
            from,
            to: task.state,
            action: TaskAction::Claim,
            actor: worker_id.to_owned(),
            at: now,
            reason: None,
        });
        self.persist(&task).await?;
        debug!(task = %id, worker = worker_id, "task claimed");
        Ok(task)
    }

    /// Release a claim back to `pending`.
    pub async fn unclaim(&self, id: TaskId, actor: &str, reason: Option<&str>) -> SosResult<Task> {
        self.transition(id, TaskAction::Unclaim, actor, reason, |task| {
            task.assigned_worker = None;
            task.claimed_at = None;
        })
        .await
    }

    /// Begin execution: `claimed → in_progress`.
    pub async fn start(&self, id: TaskId, actor: &str) -> SosResult<Task> {
        self.transition(id, TaskAction::Start, actor, None, |_| {}).await
    }

    /// Submit a result: `in_progress → review`.
    pub async fn submit(&self, id: TaskId, actor: &str, result: TaskResult) -> SosResult<Task> {
        self.transition(id, TaskAction::Submit, actor, None, |task| {
            task.result = Some(result);
        })
        .await
    }

    /// Approve a reviewed task: `review → completed`.
    pub async fn approve(&self, id: TaskId, actor: &str) -> SosResult<Task> {
        self.transition(id, TaskAction::Approve, actor, None, |task| {
            let now = Utc::now();
            task.completed_at = Some(task.claimed_at.map_or(now, |c| now.max(c)));
        })
        .await
    }

    /// Reject a reviewed task: `review → rejected`.
    pub async fn reject(&self, id: TaskId, actor: &str, reason: Option<&str>) -> SosResult<Task> {
        self.transition(id, TaskAction::Reject, actor, reason, |_| {}).await
    }

    /// Abandon an in-progress task.
    pub async fn abandon(&self, id: TaskId, actor: &str, reason: Option<&str>) -> SosResult<Task> {
        self.transition(id, TaskAction::Abandon, actor, reason, |_| {}).await
    }

    /// Reopen a rejected or abandoned task.
    pub async fn reopen(&self, id: TaskId, actor: &str) -> SosResult<Task> {
        self.transition(id, TaskAction::Reopen, actor, None, |task| {
            task.assigned_worker = None;
            task.claimed_at = None;
            task.result = None;
        })
        .await
    }

    /// Mark a completed task as reported to its originating adapter.
    pub async fn mark_reported(&self, id: TaskId) -> SosResult<Task> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        if !task.state.is_terminal_success() {
            return Err(SosError::Validation(format!(
                "task {id} is {}, only completed tasks are reported",
                task.state
            )));
        }
        task.reported = true;
        self.persist(&task).await?;
        Ok(task)
    }

    //─────────────────────────────
    //  Maintenance
    //─────────────────────────────

    /// Enforce the time-based constraints against the clock `now`.
    ///
    /// Review overruns are only collected; escalation is an event the
    /// caller publishes, not a transition.
    pub async fn enforce_timeouts(
        &self,
        now: DateTime<Utc>,
        policy: TimeoutPolicy,
    ) -> SosResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        for task in self.list(None).await? {
            match task.state {
                TaskState::Claimed if task.time_in_state(now) > policy.claim_timeout => {
                    self.unclaim(task.id, "maintenance", Some("claim timeout"))
                        .await?;
                    report.unclaimed.push(task.id);
                }
                TaskState::InProgress if task.time_in_state(now) > policy.progress_timeout => {
                    self.abandon(task.id, "maintenance", Some("progress timeout"))
                        .await?;
                    report.abandoned.push(task.id);
                }
                TaskState::Review if task.time_in_state(now) > policy.review_timeout => {
                    report.escalated.push(task.id);
                }
                _ => {}
            }
        }
        if report != MaintenanceReport::default() {
            info!(
                unclaimed = report.unclaimed.len(),
                abandoned = report.abandoned.len(),
                escalated = report.escalated.len(),
                "maintenance sweep applied timeouts"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_types::{ExecutionStatus, Subject, TaskPriority};
    use tempfile::TempDir;

    async fn store() -> (TempDir, TaskStore) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn task(title: &str) -> Task {
        Task::new(title, "do the thing", TaskPriority::Normal, Subject::agent("kasra")).unwrap()
    }

    fn result() -> TaskResult {
        TaskResult {
            output: "done".into(),
            model_used: "local-shim".into(),
            status: ExecutionStatus::Success,
        }
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (_dir, store) = store().await;
        let created = store.create(task("t1")).await.unwrap();
        let read = store.get(created.id).await.unwrap();
        assert_eq!(created, read);
        assert!(matches!(
            store.get(TaskId::new()).await,
            Err(SosError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn full_lifecycle_records_history() {
        let (_dir, store) = store().await;
        let t = store.create(task("lifecycle")).await.unwrap();
        store.claim(t.id, "w-1").await.unwrap();
        store.start(t.id, "w-1").await.unwrap();
        store.submit(t.id, "w-1", result()).await.unwrap();
        let done = store.approve(t.id, "engine").await.unwrap();

        assert_eq!(done.state, TaskState::Completed);
        assert!(done.completed_at.unwrap() >= done.claimed_at.unwrap());
        assert!(done.claimed_at.unwrap() >= done.created_at);
        let actions: Vec<TaskAction> = done.history.iter().map(|h| h.action).collect();
        assert_eq!(
            actions,
            vec![
                TaskAction::Claim,
                TaskAction::Start,
                TaskAction::Submit,
                TaskAction::Approve
            ]
        );

        let reported = store.mark_reported(t.id).await.unwrap();
        assert!(reported.reported);
    }

    #[tokio::test]
    async fn claim_is_idempotent_per_worker_and_exclusive_across() {
        let (_dir, store) = store().await;
        let t = store.create(task("claim")).await.unwrap();
        store.claim(t.id, "w-1").await.unwrap();
        // Same worker: idempotent.
        let again = store.claim(t.id, "w-1").await.unwrap();
        assert_eq!(again.assigned_worker.as_deref(), Some("w-1"));
        assert_eq!(again.history.len(), 1);
        // Different worker: refused.
        assert!(matches!(
            store.claim(t.id, "w-2").await,
            Err(SosError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_winner() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let t = store.create(task("race")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(t.id, &format!("w-{i}")).await
            }));
        }
        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(SosError::InvalidTransition { .. }) => losers += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
        let after = store.get(t.id).await.unwrap();
        assert_eq!(after.history.len(), 1);
    }

    #[tokio::test]
    async fn unclaim_returns_to_pending_with_both_events() {
        let (_dir, store) = store().await;
        let t = store.create(task("unclaim")).await.unwrap();
        store.claim(t.id, "w-1").await.unwrap();
        let back = store.unclaim(t.id, "w-1", None).await.unwrap();
        assert_eq!(back.state, TaskState::Pending);
        assert!(back.assigned_worker.is_none());
        assert!(back.claimed_at.is_none());
        let actions: Vec<TaskAction> = back.history.iter().map(|h| h.action).collect();
        assert_eq!(actions, vec![TaskAction::Claim, TaskAction::Unclaim]);
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let (_dir, store) = store().await;
        let a = store.create(task("a")).await.unwrap();
        let _b = store.create(task("b")).await.unwrap();
        store.claim(a.id, "w-1").await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let pending = store.list(Some(TaskState::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "b");
        let claimed = store.list(Some(TaskState::Claimed)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].title, "a");
    }

    #[tokio::test]
    async fn claim_timeout_unclaims_with_reason() {
        let (_dir, store) = store().await;
        let t = store.create(task("stale")).await.unwrap();
        store.claim(t.id, "w-1").await.unwrap();

        // 23h: nothing happens.
        let report = store
            .enforce_timeouts(Utc::now() + Duration::hours(23), TimeoutPolicy::default())
            .await
            .unwrap();
        assert!(report.unclaimed.is_empty());

        // 25h: auto-unclaimed with the canonical reason.
        let report = store
            .enforce_timeouts(Utc::now() + Duration::hours(25), TimeoutPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.unclaimed, vec![t.id]);
        let after = store.get(t.id).await.unwrap();
        assert_eq!(after.state, TaskState::Pending);
        let last = after.history.last().unwrap();
        assert_eq!(last.action, TaskAction::Unclaim);
        assert_eq!(last.reason.as_deref(), Some("claim timeout"));
        assert_eq!(last.actor, "maintenance");
    }

    #[tokio::test]
    async fn progress_timeout_abandons_and_review_escalates() {
        let (_dir, store) = store().await;
        let hung = store.create(task("hung")).await.unwrap();
        store.claim(hung.id, "w-1").await.unwrap();
        store.start(hung.id, "w-1").await.unwrap();

        let stuck = store.create(task("stuck-review")).await.unwrap();
        store.claim(stuck.id, "w-2").await.unwrap();
        store.start(stuck.id, "w-2").await.unwrap();
        store.submit(stuck.id, "w-2", result()).await.unwrap();

        let report = store
            .enforce_timeouts(Utc::now() + Duration::hours(169), TimeoutPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.abandoned, vec![hung.id]);
        assert_eq!(report.escalated, vec![stuck.id]);
        // Escalation does not transition.
        assert_eq!(store.get(stuck.id).await.unwrap().state, TaskState::Review);
        assert_eq!(store.get(hung.id).await.unwrap().state, TaskState::Abandoned);
    }

    #[tokio::test]
    async fn reported_requires_terminal_success() {
        let (_dir, store) = store().await;
        let t = store.create(task("early")).await.unwrap();
        assert!(store.mark_reported(t.id).await.is_err());
    }
}
