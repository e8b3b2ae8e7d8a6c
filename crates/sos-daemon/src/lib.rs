#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-daemon** – The always-on control loops.
//!
//! One process starts, and never returns from, a roster of cooperating
//! loops: heartbeat, pulse, task-claim, dream, maintenance, and report,
//! plus the worker consumer launched once at boot. Loops share no mutable
//! state except through the task store, the worker registry, and the queue
//! bus. A single watch channel is the stop signal; every loop observes it
//! on its sleep boundary. A failing tick logs with context and backs off;
//! it never takes the daemon down.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod dream;

pub use dream::{cluster_by_similarity, cosine_similarity, DreamConfig};

use sos_bus::channel::{agent_inbox, heartbeat_channel};
use sos_task_store::TimeoutPolicy;
use sos_types::{MessageEnvelope, MessageKind, Subject, TaskState};
use sos_runtime::Services;
use sos_worker::{TaskPayload, Worker};

/// Loop periods and tuning. Defaults follow the platform roster.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Heartbeat period (default 300 s).
    pub heartbeat_interval: Duration,
    /// Pulse period (default 60 s).
    pub pulse_interval: Duration,
    /// Task-claim period (default 60 s; the service wires
    /// `SOS_TASK_POLLING_INTERVAL` in here).
    pub claim_interval: Duration,
    /// Dream period (default 1800 s), also triggered by alpha drift.
    pub dream_interval: Duration,
    /// Maintenance period (default 86 400 s).
    pub maintenance_interval: Duration,
    /// Report period (default 300 s).
    pub report_interval: Duration,
    /// Dream synthesis tuning.
    pub dream: DreamConfig,
    /// Task timeout policy for maintenance.
    pub timeouts: TimeoutPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(300),
            pulse_interval: Duration::from_secs(60),
            claim_interval: Duration::from_secs(60),
            dream_interval: Duration::from_secs(1800),
            maintenance_interval: Duration::from_secs(86_400),
            report_interval: Duration::from_secs(300),
            dream: DreamConfig::default(),
            timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Grace period for retired-worker tombstones.
const TOMBSTONE_GRACE_DAYS: i64 = 30;

/// The daemon: owns the loop handles and the stop signal.
pub struct Daemon {
    services: Arc<Services>,
    config: DaemonConfig,
    stop_tx: watch::Sender<bool>,
    running: Arc<DashMap<&'static str, ()>>,
    dream_trigger: Arc<Notify>,
    bus_activity: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build a daemon over the services bundle.
    pub fn new(services: Arc<Services>, config: DaemonConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            services,
            config,
            stop_tx,
            running: Arc::new(DashMap::new()),
            dream_trigger: Arc::new(Notify::new()),
            bus_activity: Arc::new(AtomicU64::new(0)),
            handles: Vec::new(),
        }
    }

    /// Loops currently running, for the heartbeat payload.
    pub fn running_loops(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.iter().map(|e| (*e.key()).to_owned()).collect();
        names.sort();
        names
    }

    /// Trigger an off-schedule dream pass (used by the drift check).
    pub fn trigger_dream(&self) {
        self.dream_trigger.notify_one();
    }

    /// Start every loop. When `worker` is provided it is launched first and
    /// awaited to readiness, so the first claim publish already has a
    /// consumer group in place.
    pub async fn start(&mut self, worker: Option<Arc<Worker>>) -> Result<()> {
        let banner = if self.services.config.log_emojis {
            "🌞 SOS daemon waking up"
        } else {
            "SOS daemon waking up"
        };
        info!(agent = %self.services.config.agent_id, "{banner}");

        // Worker-start runs once at boot, before the claim loop exists.
        if let Some(worker) = worker {
            let (ready_tx, ready_rx) = oneshot::channel();
            let stop_rx = self.stop_tx.subscribe();
            self.running.insert("worker", ());
            let running = self.running.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(stop_rx, Some(ready_tx)).await {
                    error!(error = %e, "worker consumer exited with error");
                }
                running.remove("worker");
            }));
            ready_rx
                .await
                .map_err(|_| anyhow::anyhow!("worker failed before readiness"))?;
            debug!("worker consumer ready");
        }

        self.spawn_heartbeat();
        self.spawn_pulse();
        self.spawn_claim();
        self.spawn_dream();
        self.spawn_maintenance();
        self.spawn_report();
        Ok(())
    }

    /// Flip the stop flag and wait for every loop to exit.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("SOS daemon stopped");
    }

    fn spawn_named<F, Fut>(&mut self, name: &'static str, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let stop = self.stop_tx.subscribe();
        let running = self.running.clone();
        // Register before the task runs so the first heartbeat already
        // sees the full roster.
        running.insert(name, ());
        self.handles
            .push(tokio::spawn(run_loop(name, period, stop, running, tick)));
    }

    //─────────────────────────────
    //  Loop bodies
    //─────────────────────────────

    fn spawn_heartbeat(&mut self) {
        let services = self.services.clone();
        let running = self.running.clone();
        self.spawn_named("heartbeat", self.config.heartbeat_interval, move || {
            let services = services.clone();
            let running = running.clone();
            async move {
                let mut loops: Vec<String> =
                    running.iter().map(|e| (*e.key()).to_owned()).collect();
                loops.sort();
                let channel = heartbeat_channel(&services.config.agent_id);
                let envelope = MessageEnvelope::new(
                    MessageKind::Heartbeat,
                    Subject::agent(&services.config.agent_id),
                    &channel,
                    json!({
                        "status": "alive",
                        "timestamp": Utc::now(),
                        "loops_running": loops,
                    }),
                );
                services.bus.publish(&channel, &envelope).await?;
                Ok(())
            }
        });
    }

    fn spawn_pulse(&mut self) {
        // The pump counts observable bus events so the pulse has something
        // to attest to.
        let pump_services = self.services.clone();
        let activity = self.bus_activity.clone();
        let mut pump_stop = self.stop_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let Ok(mut subscription) = pump_services.bus.subscribe("agent:*:events").await else {
                warn!("pulse pump could not subscribe");
                return;
            };
            loop {
                tokio::select! {
                    _ = pump_stop.changed() => {
                        if *pump_stop.borrow() { break; }
                    }
                    message = subscription.recv() => {
                        if message.is_none() { break; }
                        activity.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));

        let services = self.services.clone();
        let activity = self.bus_activity.clone();
        let trigger = self.dream_trigger.clone();
        let drift_threshold = self.config.dream.drift_threshold;
        self.spawn_named("pulse", self.config.pulse_interval, move || {
            let services = services.clone();
            let activity = activity.clone();
            let trigger = trigger.clone();
            async move {
                let events = activity.swap(0, Ordering::Relaxed);
                let depth = services
                    .bus
                    .stream_len(&services.config.worker_queue)
                    .await
                    .unwrap_or(0);
                let pending = services
                    .store
                    .list(Some(TaskState::Pending))
                    .await
                    .map(|t| t.len())
                    .unwrap_or(0);
                if let Some(memory) = &services.memory {
                    let observation = format!(
                        "pulse: {events} bus events, queue depth {depth}, {pending} pending tasks"
                    );
                    memory
                        .store_observation(&services.config.agent_id, &observation)
                        .await?;

                    // Drift check rides the pulse so dreams can fire
                    // between scheduled passes.
                    if let Ok(arf) = memory.arf_state().await {
                        if arf.alpha_drift.abs() > drift_threshold {
                            debug!(alpha_drift = arf.alpha_drift, "alpha drift high, triggering dream");
                            trigger.notify_one();
                        }
                    }
                }
                Ok(())
            }
        });
    }

    fn spawn_claim(&mut self) {
        let services = self.services.clone();
        self.spawn_named("task-claim", self.config.claim_interval, move || {
            let services = services.clone();
            async move {
                if !services.config.auto_claim_enabled {
                    return Ok(());
                }
                let queue = services.config.worker_queue.clone();
                // Backpressure: a saturated stream means consumers are
                // behind; publishing more only grows the backlog.
                let depth = services.bus.stream_len(&queue).await?;
                if depth >= services.config.queue_depth_limit {
                    warn!(depth, limit = services.config.queue_depth_limit, "queue saturated, skipping claim pass");
                    return Ok(());
                }
                let claim_actor = format!("daemon:{}", services.config.agent_id);
                for task in services.store.list(Some(TaskState::Pending)).await? {
                    match services.store.claim(task.id, &claim_actor).await {
                        Ok(claimed) => {
                            let payload = TaskPayload {
                                task_id: claimed.id,
                                title: claimed.title.clone(),
                                description: claimed.description.clone(),
                                priority: claimed.priority,
                            };
                            let mut envelope = MessageEnvelope::new(
                                MessageKind::TaskCreate,
                                Subject::agent(&services.config.agent_id),
                                &queue,
                                serde_json::to_value(&payload)?,
                            )
                            .with_priority(claimed.priority);
                            if let Some(conversation_id) = &claimed.conversation_id {
                                envelope = envelope.with_correlation(conversation_id);
                            }
                            if let Err(e) = services.issuer.sign_envelope(&mut envelope) {
                                warn!(task = %claimed.id, error = %e, "envelope signing failed");
                            }
                            services.bus.stream_append(&queue, &envelope).await?;
                            debug!(task = %claimed.id, "task claimed and queued");
                        }
                        // Lost the race to another claimer; fine.
                        Err(sos_types::SosError::InvalidTransition { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        });
    }

    fn spawn_dream(&mut self) {
        let services = self.services.clone();
        let config = self.config.dream;
        let interval = self.config.dream_interval;
        let trigger = self.dream_trigger.clone();
        let mut stop = self.stop_tx.subscribe();
        let running = self.running.clone();
        running.insert("dream", ());
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                    _ = tokio::time::sleep(interval) => {}
                    _ = trigger.notified() => {
                        debug!("dream pass triggered by alpha drift");
                    }
                }
                if *stop.borrow() {
                    break;
                }
                match dream::synthesize(&services, &config).await {
                    Ok(0) => {}
                    Ok(count) => info!(dreams = count, "dream pass complete"),
                    Err(e) => error!(error = %e, "dream pass failed"),
                }
            }
            running.remove("dream");
        }));
    }

    fn spawn_maintenance(&mut self) {
        let services = self.services.clone();
        let timeouts = self.config.timeouts;
        self.spawn_named("maintenance", self.config.maintenance_interval, move || {
            let services = services.clone();
            async move {
                let report = services.store.enforce_timeouts(Utc::now(), timeouts).await?;
                for task_id in &report.escalated {
                    let channel = format!("agent:{}:events", services.config.agent_id);
                    let envelope = MessageEnvelope::new(
                        MessageKind::Event,
                        Subject::agent(&services.config.agent_id),
                        &channel,
                        json!({
                            "event": "review_escalation",
                            "task_id": task_id,
                        }),
                    );
                    services.bus.publish(&channel, &envelope).await?;
                }

                let reaped = services.limiter.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "reaped idle rate-limit buckets");
                }
                services
                    .registry
                    .prune_tombstoned(chrono::Duration::days(TOMBSTONE_GRACE_DAYS))
                    .await?;

                let inbox = agent_inbox(&services.config.agent_id);
                let poisoned = services.bus.dlq_len(&inbox).await.unwrap_or(0);
                if poisoned > 0 {
                    warn!(poisoned, inbox = %inbox, "dead-lettered messages await inspection");
                }
                Ok(())
            }
        });
    }

    fn spawn_report(&mut self) {
        let services = self.services.clone();
        self.spawn_named("report", self.config.report_interval, move || {
            let services = services.clone();
            async move {
                if !services.config.auto_report_enabled {
                    return Ok(());
                }
                for task in services.store.list(Some(TaskState::Completed)).await? {
                    if task.reported {
                        continue;
                    }
                    let inbox = agent_inbox(task.origin.name());
                    let mut envelope = MessageEnvelope::new(
                        MessageKind::TaskResult,
                        Subject::agent(&services.config.agent_id),
                        &inbox,
                        json!({
                            "task_id": task.id,
                            "title": task.title,
                            "output": task.result.as_ref().map(|r| r.output.clone()),
                            "completed_at": task.completed_at,
                        }),
                    );
                    if let Some(conversation_id) = &task.conversation_id {
                        envelope = envelope.with_correlation(conversation_id);
                    }
                    services.bus.send_direct(&inbox, &envelope).await?;
                    services.store.mark_reported(task.id).await?;
                    debug!(task = %task.id, inbox = %inbox, "completion reported");
                }
                Ok(())
            }
        });
    }
}

/// Run one loop: tick, then sleep one period, observing the stop flag on
/// the sleep boundary. A failed tick sleeps an escalating backoff instead
/// of the period.
async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    running: Arc<DashMap<&'static str, ()>>,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    debug!(loop_name = name, ?period, "loop started");
    let mut backoff = Duration::from_secs(1);
    loop {
        let wait = match tick().await {
            Ok(()) => {
                backoff = Duration::from_secs(1);
                period
            }
            Err(e) => {
                error!(loop_name = name, error = %e, ?backoff, "loop tick failed");
                let wait = backoff;
                backoff = (backoff * 2).min(Duration::from_secs(300));
                wait
            }
        };
        if sleep_or_stop(&mut stop, wait).await {
            break;
        }
    }
    running.remove(name);
    debug!(loop_name = name, "loop exited");
}

/// Sleep `period`, returning early (true) when the stop flag flips.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => *stop.borrow(),
        _ = stop.changed() => *stop.borrow(),
    }
}
