//! Worker (§4.E): claims tasks from one queue and dispatches them to
//! registered handlers under a concurrency cap, a per-attempt timeout, and a
//! retry/backoff policy, handing completion and failure back to the task's
//! group when it has one.
//!
//! Concurrency shape: a `tokio::sync::Semaphore` caps in-flight attempts, a
//! `JoinSet` collects them, and an in-flight gauge is updated around each
//! spawned attempt. Handler dispatch additionally races `tokio::time::timeout`
//! against the handler future; the handler registry is a runtime
//! `HashMap<String, Arc<dyn Handler>>` rather than a compile-time generic,
//! since handlers here are looked up by task name at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Backoff, QueueDefaults};
use crate::dlq::DlqManager;
use crate::error::{ErrorCategory, QueueError, RetryStrategy};
use crate::group::{FailOutcome, GroupRegistry};
use crate::metrics::{self, ErrorType, MetricsTimer, TaskStatus};
use crate::observer::{ObserverEvent, TaskObserver};
use crate::queue::Queue;
use crate::store::Store;
use crate::task::{RemoveOnComplete, Task, TaskErrorInfo, TaskState};

/// A registered task handler (§4.E "Handler contract"). Implementations
/// receive `task.handler_payload()` semantics are the caller's concern —
/// the worker hands over the whole [`Task`] so a handler can inspect
/// anything it needs, but is expected to read `task.handler_payload()` for
/// its actual arguments.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, task: &Task) -> Result<Value, QueueError>;
}

/// Adapts a plain async closure into a [`Handler`], for the common case of a
/// stateless handler registered as e.g. `FnHandler(|task| async move { ... })`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&Task) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, QueueError>> + Send,
{
    async fn call(&self, task: &Task) -> Result<Value, QueueError> {
        (self.0)(task).await
    }
}

/// Per-worker tunables (§4.E, §6).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub concurrency: usize,
    pub heartbeat_interval_ms: u64,
}

fn worker_status_key(id: &str) -> String {
    format!("worker:{id}:status")
}

fn worker_heartbeat_key(id: &str) -> String {
    format!("worker:{id}:lastHeartbeat")
}

fn worker_active_key(id: &str) -> String {
    format!("worker:{id}:activeTasks")
}

fn worker_history_key(id: &str) -> String {
    format!("worker:{id}:history")
}

pub(crate) fn workers_set_key() -> &'static str {
    "workers:set"
}

pub(crate) fn queue_workers_key(queue: &str) -> String {
    format!("queue:{queue}:workers")
}

fn task_history_key(task_id: &str) -> String {
    format!("task:{task_id}:history")
}

fn group_history_key(group: &str) -> String {
    format!("group:{group}:history")
}

fn queue_history_key(queue: &str) -> String {
    format!("queue:{queue}:history")
}

const GLOBAL_HISTORY_KEY: &str = "history:global";

/// Outcome of applying the retry/backoff policy to a failed ungrouped task
/// (§4.E "Failure"). Shared by [`Worker::handle_failure`] and the Queue
/// Manager's stuck-task sweep so both derive the same decision from the
/// same inputs rather than duplicating the backoff math.
pub(crate) enum RetryDecision {
    Retry { due_at_ms: i64 },
    Exhausted,
}

/// Bump `task.retry_count` and decide whether it stays under `defaults`'s
/// (or its own override's) retry budget. Mutates `task.state` to `Delayed`
/// or `Failed` accordingly; does not touch `task.error` or persist anything
/// — the caller owns both.
pub(crate) fn resolve_retry(task: &mut Task, defaults: &QueueDefaults, now_ms: i64) -> RetryDecision {
    task.retry_count += 1;
    let max_retries = task.options.max_retries.unwrap_or(defaults.max_retries);

    if task.retry_count <= max_retries {
        let backoff = task.options.backoff.unwrap_or(defaults.backoff);
        let base_delay = task.options.retry_delay_ms.unwrap_or(defaults.retry_delay_ms);
        let strategy = match backoff {
            Backoff::Fixed => RetryStrategy::Fixed {
                delay_ms: base_delay,
                max_retries,
            },
            Backoff::Exponential => RetryStrategy::Exponential {
                base_delay_ms: base_delay,
                max_delay_ms: base_delay.saturating_mul(2u64.saturating_pow(max_retries.min(10))),
                max_retries,
            },
        };
        let delay = strategy
            .delay_for_attempt(task.retry_count - 1)
            .unwrap_or(Duration::from_millis(base_delay));
        task.state = TaskState::Delayed;
        RetryDecision::Retry {
            due_at_ms: now_ms + delay.as_millis() as i64,
        }
    } else {
        task.state = TaskState::Failed;
        RetryDecision::Exhausted
    }
}

fn task_state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Waiting => "waiting",
        TaskState::Active => "active",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
        TaskState::Delayed => "delayed",
        TaskState::Paused => "paused",
        TaskState::WaitingChildren => "waiting_children",
        TaskState::Unknown => "unknown",
    }
}

const WORKER_HISTORY_CAP: isize = 100;
const TASK_HISTORY_CAP: isize = 50;
const GLOBAL_HISTORY_CAP: isize = 1000;
const QUEUE_HISTORY_CAP: isize = 500;
const GROUP_HISTORY_CAP: isize = 200;

/// One attempt's outcome, appended to every scoped history list it touches
/// (§6: worker/task/global/queue/group, capped at 100/50/1000/500/200
/// entries via `LTRIM` after each append).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub status: String,
    pub duration_ms: u64,
    pub group: Option<String>,
    pub error: Option<String>,
    pub timestamp: i64,
    pub worker_id: String,
    pub queue_name: String,
}

/// One worker attached to exactly one queue (§4.E). Cheap to clone — the
/// handler map and semaphore are `Arc`-shared, and all mutable bookkeeping
/// lives in the store.
#[derive(Clone)]
pub struct Worker {
    id: String,
    store: Store,
    queue: Queue,
    observer: Arc<TaskObserver>,
    groups: GroupRegistry,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    config: WorkerConfig,
    queue_defaults: QueueDefaults,
    dlq_alert_threshold: u64,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        store: Store,
        config: WorkerConfig,
        queue_defaults: QueueDefaults,
        observer: Arc<TaskObserver>,
        groups: GroupRegistry,
        dlq_alert_threshold: u64,
        handlers: HashMap<String, Arc<dyn Handler>>,
    ) -> Self {
        let queue = Queue::new(store.clone(), config.queue.clone());
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            id: format!("{}-{}", config.queue, Uuid::new_v4()),
            store,
            queue,
            observer,
            groups,
            handlers: Arc::new(handlers),
            config,
            queue_defaults,
            dlq_alert_threshold,
            semaphore,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main loop (§4.E "Loop"): claim tasks and dispatch up to `concurrency`
    /// concurrent attempts, until `shutdown` fires. Also drives the
    /// heartbeat timer (§4.E "Heartbeat").
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        self.store
            .hash_set(&worker_status_key(&self.id), "status", "active")
            .await?;
        self.store.set_add(workers_set_key(), &self.id).await?;
        self.store.set_add(&queue_workers_key(&self.config.queue), &self.id).await?;
        self.spawn_heartbeat(shutdown.clone());

        let mut join_set: JoinSet<()> = JoinSet::new();
        const POLL_INTERVAL: Duration = Duration::from_millis(200);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let status = self.store.hash_get(&worker_status_key(&self.id), "status").await.ok().flatten();
            if status.as_deref() == Some("paused") {
                tokio::select! {
                    _ = shutdown.changed() => {},
                    _ = tokio::time::sleep(POLL_INTERVAL) => {},
                }
                continue;
            }

            let now = chrono::Utc::now().timestamp_millis();
            let claimed = match self.queue.claim_next(now).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "worker: claim failed, backing off");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    _ = shutdown.changed() => {},
                    _ = tokio::time::sleep(POLL_INTERVAL) => {},
                }
                continue;
            };

            let worker = self.clone();
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");
            join_set.spawn(async move {
                let _permit = permit;
                let current = worker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_in_flight_tasks(&worker.config.queue, current as f64);
                worker.attempt(task).await;
                let current = worker.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::set_in_flight_tasks(&worker.config.queue, current as f64);
            });

            // Reap finished attempts without blocking the claim loop on them.
            while join_set.try_join_next().is_some() {}
        }

        while join_set.join_next().await.is_some() {}
        self.store
            .hash_set(&worker_status_key(&self.id), "status", "stopped")
            .await?;
        info!(worker = %self.id, "worker: shut down");
        Ok(())
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) {
        let store = self.store.clone();
        let id = self.id.clone();
        let interval_ms = self.config.heartbeat_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        if let Err(e) = store
                            .hash_set(&worker_heartbeat_key(&id), "lastHeartbeat", &now.to_string())
                            .await
                        {
                            warn!(worker = %id, error = %e, "worker: heartbeat write failed");
                        }
                    }
                }
            }
        });
    }

    /// One task attempt (§4.E steps 2-6): active-set bookkeeping, handler
    /// dispatch under a timeout, then success/failure handling.
    async fn attempt(&self, mut task: Task) {
        let active_entry = format!("{}:{}", task.id, task.name);
        if let Err(e) = self.store.set_add(&worker_active_key(&self.id), &active_entry).await {
            warn!(worker = %self.id, error = %e, "worker: failed to record active task");
        }

        task.progress = 0;
        if let Err(e) = self.queue.save_job(&task).await {
            warn!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to persist progress reset");
        }
        self.notify_progress(&task).await;
        self.notify_status_change(&task).await;

        let Some(handler) = self.handlers.get(&task.name).cloned() else {
            let _ = self.store.set_rem(&worker_active_key(&self.id), &active_entry).await;
            self.handle_handler_missing(&task).await;
            return;
        };

        let timeout_ms = task.options.timeout_ms.unwrap_or(self.queue_defaults.timeout_ms);
        let timer = MetricsTimer::new(&self.config.queue, "attempt");
        let started = std::time::Instant::now();

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), handler.call(&task)).await;

        let _ = self.store.set_rem(&worker_active_key(&self.id), &active_entry).await;

        match outcome {
            Ok(Ok(result)) => {
                timer.stop();
                task.result = Some(result);
                self.handle_success(task, started.elapsed()).await;
            }
            Ok(Err(e)) => {
                timer.stop();
                self.handle_failure(task, e, started.elapsed()).await;
            }
            Err(_) => {
                timer.stop();
                self.handle_failure(task, QueueError::Timeout(Duration::from_millis(timeout_ms)), started.elapsed())
                    .await;
            }
        }
    }

    /// Best-effort `ProgressUpdate`/`TaskProgress` publish (§4.B, §6). Both
    /// channels carry the same payload — `task_progress` is the raw numeric
    /// signal, `progress_update` is the generic lifecycle notification a
    /// dashboard would subscribe to alongside `status_change`.
    async fn notify_progress(&self, task: &Task) {
        let payload = Some(serde_json::json!({ "progress": task.progress, "group": task.group }));
        for event in [ObserverEvent::ProgressUpdate, ObserverEvent::TaskProgress] {
            if let Err(e) = self.observer.notify(event, &task.id, "progress", payload.clone()).await {
                warn!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to publish progress event");
            }
        }
    }

    /// Best-effort `StatusChange` publish whenever a task's lifecycle state
    /// moves (§4.B).
    async fn notify_status_change(&self, task: &Task) {
        let status = task_state_label(task.state);
        if let Err(e) = self
            .observer
            .notify(
                ObserverEvent::StatusChange,
                &task.id,
                status,
                Some(serde_json::json!({ "group": task.group })),
            )
            .await
        {
            warn!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to publish status-change event");
        }
    }

    async fn handle_handler_missing(&self, task: &Task) {
        let error = QueueError::HandlerMissing(task.name.clone());
        warn!(worker = %self.id, task_id = %task.id, task_name = %task.name, "worker: no handler registered");
        metrics::record_error(&self.config.queue, ErrorType::Permanent);

        if let Some(group) = &task.group {
            if let Some(engine) = self.groups.read().await.get(group).cloned() {
                if let Err(e) = engine
                    .abort_task(&task.id, &error.to_string(), &self.config.queue)
                    .await
                {
                    error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to abort grouped task");
                }
                self.record_history(task, "dlq", 0, Some(error.to_string())).await;
                return;
            }
        }

        let dlq = self.dlq_for();
        if let Err(e) = dlq.add_failed_task(task.clone(), error.to_string()).await {
            error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to DLQ handler-missing task");
        }
        if let Err(e) = self.queue.remove_job(&task.id).await {
            error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to remove DLQ'd task from queue");
        }
        self.record_history(task, "dlq", 0, Some(error.to_string())).await;
    }

    async fn handle_success(&self, mut task: Task, duration: Duration) {
        task.state = TaskState::Completed;
        task.updated_at = chrono::Utc::now().timestamp_millis();
        task.progress = 100;

        metrics::record_task_processed(&self.config.queue, TaskStatus::Succeeded);

        if let Some(group) = task.group.clone() {
            if let Some(engine) = self.groups.read().await.get(&group).cloned() {
                if let Err(e) = engine.complete_task(&task.id).await {
                    error!(worker = %self.id, task_id = %task.id, error = %e, "worker: group completion failed");
                }
            }
        }

        if let Err(e) = self.queue.save_job(&task).await {
            error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to persist completed task");
        }
        if matches!(
            task.options.remove_on_complete,
            None | Some(RemoveOnComplete::Always)
        ) {
            let _ = self.queue.remove_job(&task.id).await;
        }

        let group = task.group.clone();
        if let Err(e) = self
            .observer
            .notify(
                ObserverEvent::TaskCompleted,
                &task.id,
                "completed",
                Some(serde_json::json!({ "group": group })),
            )
            .await
        {
            warn!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to publish completion event");
        }
        self.notify_progress(&task).await;
        self.notify_status_change(&task).await;

        self.record_history(&task, "completed", duration.as_millis() as u64, None).await;
        debug!(worker = %self.id, task_id = %task.id, duration_ms = duration.as_millis(), "worker: task completed");
    }

    async fn handle_failure(&self, mut task: Task, error: QueueError, duration: Duration) {
        let category = error.category();
        let error_type = match category {
            ErrorCategory::Transient => ErrorType::Transient,
            ErrorCategory::Permanent => ErrorType::Permanent,
            ErrorCategory::RateLimited => ErrorType::RateLimited,
        };
        metrics::record_task_processed(&self.config.queue, TaskStatus::Failed);
        metrics::record_error(&self.config.queue, error_type);
        warn!(worker = %self.id, task_id = %task.id, error = %error, category = ?category, "worker: task attempt failed");

        if let Some(group) = task.group.clone() {
            if let Some(engine) = self.groups.read().await.get(&group).cloned() {
                match engine
                    .fail_task(&task.id, &error.to_string(), &self.config.queue, chrono::Utc::now().timestamp_millis())
                    .await
                {
                    Ok(outcome) => {
                        let status = match outcome {
                            FailOutcome::Retrying { .. } => "failed",
                            FailOutcome::DeadLettered { .. } => "dlq",
                        };
                        self.record_history(&task, status, duration.as_millis() as u64, Some(error.to_string()))
                            .await;
                    }
                    Err(e) => {
                        error!(worker = %self.id, task_id = %task.id, error = %e, "worker: group failure handling errored")
                    }
                }
                let _ = self
                    .observer
                    .notify(
                        ObserverEvent::TaskFailed,
                        &task.id,
                        "failed",
                        Some(serde_json::json!({ "group": group, "error": error.to_string() })),
                    )
                    .await;
                task.state = TaskState::Failed;
                self.notify_status_change(&task).await;
                return;
            }
        }

        // Ungrouped: the worker owns its own retry/backoff and DLQ routing —
        // grouped tasks delegate this entirely to the Group Engine above,
        // which tracks its own retry counter and avoids a duplicate DLQ push.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let decision = resolve_retry(&mut task, &self.queue_defaults, now_ms);
        metrics::record_retry(&self.config.queue, task.retry_count);
        task.error = Some(TaskErrorInfo {
            message: error.to_string(),
            stack: None,
        });

        match decision {
            RetryDecision::Retry { due_at_ms } => {
                if let Err(e) = self.queue.schedule_retry(&task, due_at_ms).await {
                    error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to schedule retry");
                }
                self.record_history(&task, "failed", duration.as_millis() as u64, Some(error.to_string()))
                    .await;
            }
            RetryDecision::Exhausted => {
                let dlq = self.dlq_for();
                if let Err(e) = dlq.add_failed_task(task.clone(), error.to_string()).await {
                    error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to DLQ exhausted task");
                }
                if let Err(e) = self.queue.remove_job(&task.id).await {
                    error!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to remove DLQ'd task from queue");
                }
                self.record_history(&task, "dlq", duration.as_millis() as u64, Some(error.to_string()))
                    .await;
            }
        }
        self.notify_status_change(&task).await;

        if let Err(e) = self
            .observer
            .notify(
                ObserverEvent::TaskFailed,
                &task.id,
                "failed",
                Some(serde_json::json!({ "error": error.to_string() })),
            )
            .await
        {
            warn!(worker = %self.id, task_id = %task.id, error = %e, "worker: failed to publish failure event");
        }
    }

    fn dlq_for(&self) -> DlqManager {
        DlqManager::new(self.store.clone(), self.config.queue.as_str(), self.dlq_alert_threshold, self.observer.clone())
    }

    /// Append one capped history entry to every scoped list this task
    /// touches. 7-day retention (§6) is enforced by the cap itself at normal
    /// throughput; `LTRIM` bounds each list's length rather than its age.
    async fn record_history(&self, task: &Task, status: &str, duration_ms: u64, error: Option<String>) {
        let entry = HistoryEntry {
            task_id: task.id.clone(),
            status: status.to_string(),
            duration_ms,
            group: task.group.clone(),
            error,
            timestamp: chrono::Utc::now().timestamp_millis(),
            worker_id: self.id.clone(),
            queue_name: self.config.queue.clone(),
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };

        let writes: [(String, isize); 4] = [
            (worker_history_key(&self.id), WORKER_HISTORY_CAP),
            (task_history_key(&task.id), TASK_HISTORY_CAP),
            (GLOBAL_HISTORY_KEY.to_string(), GLOBAL_HISTORY_CAP),
            (queue_history_key(&self.config.queue), QUEUE_HISTORY_CAP),
        ];
        for (key, cap) in &writes {
            if let Err(e) = self.store.list_rpush(key, &json).await {
                warn!(key, error = %e, "worker: history append failed");
                continue;
            }
            let _ = self.store.list_trim(key, -*cap, -1).await;
        }

        if let Some(group) = &task.group {
            let key = group_history_key(group);
            if self.store.list_rpush(&key, &json).await.is_ok() {
                let _ = self.store.list_trim(&key, -GROUP_HISTORY_CAP, -1).await;
            }
        }
    }
}

/// A read/control handle onto a worker identified only by its id — unlike
/// [`Worker`] itself, this does not require the handlers/semaphore of a live
/// process, only a [`Store`] and the id string (§4.E "introspection and
/// control"). Obtained from [`crate::manager::QueueManager::list_workers`]
/// or [`crate::manager::QueueManager::worker_handle`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    store: Store,
    id: String,
}

impl WorkerHandle {
    pub(crate) fn new(store: Store, id: String) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Result<Option<String>, QueueError> {
        self.store.hash_get(&worker_status_key(&self.id), "status").await
    }

    pub async fn last_heartbeat(&self) -> Result<Option<i64>, QueueError> {
        let raw = self
            .store
            .hash_get(&worker_heartbeat_key(&self.id), "lastHeartbeat")
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    pub async fn active_tasks(&self) -> Result<Vec<String>, QueueError> {
        self.store.set_members(&worker_active_key(&self.id)).await
    }

    /// Most recent `count` history entries, oldest first (§6).
    pub async fn history(&self, count: isize) -> Result<Vec<HistoryEntry>, QueueError> {
        let raw = self.store.list_range(&worker_history_key(&self.id), -count, -1).await?;
        Ok(raw.iter().filter_map(|s| serde_json::from_str(s).ok()).collect())
    }

    /// Stop claiming new tasks without tearing the process down; in-flight
    /// attempts run to completion (§4.E "pause/resume").
    pub async fn pause(&self) -> Result<(), QueueError> {
        self.store.hash_set(&worker_status_key(&self.id), "status", "paused").await
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.store.hash_set(&worker_status_key(&self.id), "status", "active").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_key_naming() {
        assert_eq!(worker_status_key("w1"), "worker:w1:status");
        assert_eq!(worker_active_key("w1"), "worker:w1:activeTasks");
        assert_eq!(task_history_key("echo-1"), "task:echo-1:history");
    }

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn call(&self, task: &Task) -> Result<Value, QueueError> {
            Ok(task.handler_payload().clone())
        }
    }

    #[tokio::test]
    async fn test_echo_handler_returns_payload() {
        let task = Task::new(
            "echo",
            serde_json::json!({ "args": ["hi"] }),
            crate::task::TaskOptions::default(),
            0,
        );
        let result = EchoHandler.call(&task).await.unwrap();
        assert_eq!(result, serde_json::json!({ "args": ["hi"] }));
    }
}
