//! Group Engine (§4.F): admits tasks into a named group, then hands them to
//! their target queue one batch at a time under a concurrency cap and an
//! ordering strategy (FIFO/LIFO/PRIORITY/ROUND_ROBIN).
//!
//! A group's membership lives in a set (`tasks`), its ordering in a sorted
//! set (`order`, scored by [`composite_score`]), and in-flight selections in
//! a plain set (`processing`) plus a start-time hash (`processing_start`) —
//! the same ordered-index-plus-detail-hash shape [`crate::queue::Queue`] and
//! [`crate::dlq::DlqManager`] use. Selection runs as a single server-side Lua
//! script rather than client-side `WATCH`/`MULTI`: every [`Store`] clone
//! shares one physical connection, and `WATCH` state belongs to the
//! connection, not the logical caller, so `GroupEngine::process_next_batch`'s
//! concurrent `get_next_task` calls would otherwise silently invalidate one
//! another's watches. The group lock and rate limiter are
//! [`crate::lock::DistributedLock`] and [`crate::lock::SlidingWindowRateLimiter`]
//! (§4.F); the in-process `processing`-count gate and cached stats mirror an
//! atomic/RwLock bookkeeping shape, even though the actual cross-process
//! concurrency gate lives in the store, not in memory.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use redis::Script;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{GroupDefaults, Strategy};
use crate::dlq::DlqManager;
use crate::error::QueueError;
use crate::lock::{DistributedLock, RateLimitOutcome, SlidingWindowRateLimiter};
use crate::observer::{ObserverEvent, TaskObserver};
use crate::queue::Queue;
use crate::store::Store;
use crate::task::{composite_score, Task, TaskOptions, TaskState};

fn tasks_key(group: &str) -> String {
    format!("group:{group}:tasks")
}

fn order_key(group: &str) -> String {
    format!("group:{group}:order")
}

fn processing_key(group: &str) -> String {
    format!("group:{group}:processing")
}

fn processing_start_key(group: &str) -> String {
    format!("group:{group}:processing_start")
}

fn options_key(group: &str) -> String {
    format!("group:{group}:options")
}

fn data_key(group: &str) -> String {
    format!("group:{group}:data")
}

fn method_key(group: &str) -> String {
    format!("group:{group}:method")
}

fn retries_key(group: &str) -> String {
    format!("group:{group}:retries")
}

fn rate_limit_key(group: &str) -> String {
    format!("group:{group}:rate_limit")
}

fn lock_key(group: &str) -> String {
    format!("group:{group}:lock")
}

fn stats_key(group: &str) -> String {
    format!("group:{group}:stats")
}

/// Atomically select a candidate from `KEYS[1]` (`order`) and move it into
/// `KEYS[2]` (`processing`) / `KEYS[3]` (`processing_start`), gated by
/// `ARGV[1]` (`max_concurrency`) (§4.F "Selection"). `ARGV[2]` picks the
/// read direction: `LIFO`/`PRIORITY` read the highest score, everything else
/// (`FIFO`, `ROUND_ROBIN`) reads the lowest — round-robin has no separate
/// server-side bookkeeping of its own; fairness here falls out of `order`
/// scores advancing with `enqueueEpochMs` as each group member gets
/// re-admitted, same as FIFO.
static SELECT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local in_flight = redis.call("SCARD", KEYS[2])
        if in_flight >= tonumber(ARGV[1]) then
            return false
        end

        local picked
        if ARGV[2] == "LIFO" or ARGV[2] == "PRIORITY" then
            picked = redis.call("ZREVRANGE", KEYS[1], 0, 0)[1]
        else
            picked = redis.call("ZRANGE", KEYS[1], 0, 0)[1]
        end
        if not picked then
            return false
        end

        redis.call("ZREM", KEYS[1], picked)
        redis.call("SADD", KEYS[2], picked)
        redis.call("HSET", KEYS[3], picked, ARGV[3])
        return picked
        "#,
    )
});

/// Cached snapshot of a group's bookkeeping counters (§4.F `getStats`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

/// Outcome of a [`GroupEngine::fail_task`] call, for the worker's narrow
/// completion hook and for tests exercising the retry-then-DLQ path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-inserted into `order`; will be reselected once its retry delay elapses.
    Retrying { retry_count: u32 },
    /// Retry budget exhausted; handed to the DLQ for `queue`.
    DeadLettered { queue: String },
}

/// A named group's admission/selection/completion surface. Stateless beyond
/// its name and config — all membership lives in the store.
pub struct GroupEngine {
    store: Store,
    name: String,
    config: GroupDefaults,
    observer: Arc<TaskObserver>,
    lock: DistributedLock,
    rate_limiter: SlidingWindowRateLimiter,
    dlq_alert_threshold: u64,
    shutdown: tokio::sync::watch::Sender<bool>,
}

/// Registry of live groups shared between the [`crate::manager::QueueManager`]
/// that owns group lifecycle and the [`crate::worker::Worker`]s that need to
/// report completion/failure back to whichever group a task belongs to. This
/// is the entire surface a worker sees of group internals (§9 "narrow
/// Worker/GroupEngine interface") — two methods, not the engine's admission
/// or selection machinery.
pub type GroupRegistry = Arc<RwLock<HashMap<String, Arc<GroupEngine>>>>;

impl GroupEngine {
    pub fn new(
        store: Store,
        name: impl Into<String>,
        config: GroupDefaults,
        observer: Arc<TaskObserver>,
        dlq_alert_threshold: u64,
    ) -> Self {
        let lock = DistributedLock::new(store.clone());
        let rate_limiter = SlidingWindowRateLimiter::new(store.clone());
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            store,
            name: name.into(),
            config,
            observer,
            lock,
            rate_limiter,
            dlq_alert_threshold,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GroupDefaults {
        &self.config
    }

    /// Start the 1 s promotion timer that drains `order` into the target
    /// queue without requiring any worker to poll this group directly (§4.F
    /// "Concurrency loop"). Safe to call more than once per process only if
    /// the caller ensures a single `Arc<GroupEngine>` per group name — the
    /// manager's registry guarantees that.
    pub fn spawn_promotion_loop(self: &Arc<Self>) {
        let engine = self.clone();
        let mut shutdown = engine.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        if let Err(e) = engine.process_next_batch().await {
                            warn!(group = %engine.name, error = %e, "group: promotion batch failed");
                        }
                    }
                }
            }
        });
    }

    /// Launch up to `concurrency` concurrent [`GroupEngine::get_next_task`]
    /// calls (§4.F "Concurrency loop"). Each selected task is handed to its
    /// target queue by `get_next_task` itself; this just drives the fan-out.
    async fn process_next_batch(&self) -> Result<(), QueueError> {
        let now = chrono_now_ms();
        let attempts = (0..self.config.concurrency).map(|_| self.get_next_task(now));
        for result in futures::future::join_all(attempts).await {
            result?;
        }
        Ok(())
    }

    /// Stop this group's promotion loop (§4.G `close` fan-out).
    pub fn close_loop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn dlq_for(&self, queue: &str) -> DlqManager {
        DlqManager::new(self.store.clone(), queue, self.dlq_alert_threshold, self.observer.clone())
    }

    /// Best-effort lock release: logs rather than propagates, so a release
    /// failure (e.g. the lock already expired) never shadows the real error
    /// from the critical section it guarded.
    async fn release_lock(&self, guard: &crate::lock::LockGuard) {
        if let Err(e) = self.lock.release(guard).await {
            warn!(group = %self.name, error = %e, "group: failed to release lock");
        }
    }

    /// Best-effort `GroupChange` publish — membership changes are reported
    /// on a best-effort basis, same as every other observer call here; a
    /// failed publish never rolls back the bookkeeping it describes.
    async fn notify_group_change(&self, reason: &str) {
        if let Err(e) = self
            .observer
            .notify(
                ObserverEvent::GroupChange,
                &self.name,
                reason,
                Some(serde_json::json!({ "group": self.name })),
            )
            .await
        {
            warn!(group = %self.name, error = %e, "group: failed to publish group-change event");
        }
    }

    /// Admit a task into the group (§4.F "Admission"). Applies the group's
    /// rate limit (or a per-submission override), then under the group lock:
    /// persists the task's method/data/options, indexes it in `tasks` and
    /// `order`, and refreshes the cached stats.
    pub async fn add_task(
        &self,
        method: impl Into<String>,
        data: Value,
        options: TaskOptions,
        now_ms: i64,
    ) -> Result<Task, QueueError> {
        let method = method.into();

        let rate_limit = options.rate_limit.map(|r| (r.max, r.duration_ms)).or_else(|| {
            self.config.rate_limit.map(|r| (r.max, r.duration_ms))
        });
        if let Some((max, duration_ms)) = rate_limit {
            let outcome = self
                .rate_limiter
                .check_and_record(&rate_limit_key(&self.name), max, duration_ms, now_ms)
                .await?;
            if outcome == RateLimitOutcome::Limited {
                return Err(QueueError::RateLimited(format!(
                    "group '{}' exceeded its rate limit of {max} per {duration_ms}ms",
                    self.name
                )));
            }
        }

        let priority = if options.priority != 0 {
            options.priority
        } else {
            self.config.priority
        };
        let mut task = Task::new(method.clone(), data.clone(), options.clone(), now_ms);
        task.group = Some(self.name.clone());

        let guard = self
            .lock
            .acquire_with_retry(&lock_key(&self.name), self.config.lock_ttl_ms, 3, 50)
            .await?;

        let result = async {
            self.store.set_add(&tasks_key(&self.name), &task.id).await?;
            let score = composite_score(priority, task.options.weight, now_ms);
            self.store.zadd(&order_key(&self.name), &task.id, score).await?;
            self.store
                .hash_set(&method_key(&self.name), &task.id, &method)
                .await?;
            self.store
                .hash_set(&data_key(&self.name), &task.id, &serde_json::to_string(&data)?)
                .await?;
            self.store
                .hash_set(
                    &options_key(&self.name),
                    &task.id,
                    &serde_json::to_string(&task.options)?,
                )
                .await?;
            self.refresh_stats().await?;
            Ok::<(), QueueError>(())
        }
        .await;

        self.release_lock(&guard).await;
        result?;

        self.observer
            .notify(ObserverEvent::TaskAdded, &task.id, "waiting", Some(serde_json::json!({ "group": self.name })))
            .await?;
        self.notify_group_change("admitted").await;
        debug!(group = %self.name, task_id = %task.id, "group: task admitted");
        Ok(task)
    }

    /// Select the next eligible task per the group's strategy and hand it to
    /// its target queue (§4.F "Selection" + "Enqueue"). Returns `None` if the
    /// group has no ready task or is already at `maxConcurrency`.
    ///
    /// Selection is a single atomic Lua script (`SELECT_SCRIPT`): many
    /// workers calling this concurrently is the normal case, and a
    /// server-side check-and-claim has no conflict to retry, unlike a
    /// client-side `WATCH`.
    pub async fn get_next_task(&self, now_ms: i64) -> Result<Option<Task>, QueueError> {
        let Some(task_id) = self.try_select_once(now_ms).await? else {
            return Ok(None);
        };
        let task = self.load_task(&task_id, now_ms).await?;
        self.enqueue_selected(&task).await?;
        Ok(Some(task))
    }

    /// Run `SELECT_SCRIPT` once: picks a candidate, moves it from `order`
    /// into `processing`, and stamps `processing_start`, all atomically.
    async fn try_select_once(&self, now_ms: i64) -> Result<Option<String>, QueueError> {
        let strategy = match self.config.strategy {
            Strategy::Lifo => "LIFO",
            Strategy::Priority => "PRIORITY",
            Strategy::Fifo | Strategy::RoundRobin => "FIFO",
        };
        self.store
            .eval_script(
                &SELECT_SCRIPT,
                &[
                    order_key(&self.name),
                    processing_key(&self.name),
                    processing_start_key(&self.name),
                ],
                &[self.config.max_concurrency.to_string(), strategy.to_string(), now_ms.to_string()],
            )
            .await
    }

    async fn load_task(&self, task_id: &str, now_ms: i64) -> Result<Task, QueueError> {
        let method = self
            .store
            .hash_get(&method_key(&self.name), task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("group task '{task_id}' missing method")))?;
        let data: Value = self
            .store
            .hash_get(&data_key(&self.name), task_id)
            .await?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?
            .unwrap_or(Value::Null);
        let options: TaskOptions = self
            .store
            .hash_get(&options_key(&self.name), task_id)
            .await?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?
            .unwrap_or_default();
        let retry_count: u32 = self
            .store
            .hash_get(&retries_key(&self.name), task_id)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut task = Task::new(method, data, options, now_ms);
        task.id = task_id.to_string();
        task.group = Some(self.name.clone());
        task.state = TaskState::Active;
        task.retry_count = retry_count;
        task.updated_at = now_ms;
        Ok(task)
    }

    /// Hand a selected task to its target queue, `jobId = taskId` (§4.F
    /// "Enqueue"). Idempotent: a second call for the same id (e.g. a retried
    /// selection after a `WATCH` conflict resolved in our favor on a previous
    /// attempt) leaves the existing queue entry alone.
    async fn enqueue_selected(&self, task: &Task) -> Result<(), QueueError> {
        let queue = Queue::new(self.store.clone(), task.options.queue_name().to_string());
        if queue.get_job(&task.id).await?.is_none() {
            queue.add(task).await?;
        }
        Ok(())
    }

    /// Mark a task completed (§4.F "Completion"): drop its bookkeeping and
    /// refresh the cached stats, under the group lock.
    pub async fn complete_task(&self, task_id: &str) -> Result<(), QueueError> {
        let guard = self
            .lock
            .acquire_with_retry(&lock_key(&self.name), self.config.lock_ttl_ms, 3, 50)
            .await?;
        let result = self.forget_task(task_id).await;
        self.release_lock(&guard).await;
        result?;
        self.refresh_stats().await?;
        self.notify_group_change("completed").await;
        debug!(group = %self.name, task_id, "group: task completed");
        Ok(())
    }

    /// Permanently abandon a task without consulting the retry budget — used
    /// for failures that retrying can never fix (e.g. no handler registered
    /// for the task's name).
    pub async fn abort_task(&self, task_id: &str, error: &str, queue_name: &str) -> Result<(), QueueError> {
        let guard = self
            .lock
            .acquire_with_retry(&lock_key(&self.name), self.config.lock_ttl_ms, 3, 50)
            .await?;
        let result = async {
            let task = self.load_task(task_id, chrono_now_ms()).await?;
            self.forget_task(task_id).await?;
            Ok::<Task, QueueError>(task)
        }
        .await;
        self.release_lock(&guard).await;
        let task = result?;
        self.refresh_stats().await?;
        self.dlq_for(queue_name).add_failed_task(task, error.to_string()).await?;
        self.notify_group_change("aborted").await;
        warn!(group = %self.name, task_id, error, "group: task aborted without retry");
        Ok(())
    }

    async fn forget_task(&self, task_id: &str) -> Result<(), QueueError> {
        self.store.set_rem(&processing_key(&self.name), task_id).await?;
        self.store.hash_del(&processing_start_key(&self.name), task_id).await?;
        self.store.set_rem(&tasks_key(&self.name), task_id).await?;
        self.store.zrem(&order_key(&self.name), task_id).await?;
        self.store.hash_del(&method_key(&self.name), task_id).await?;
        self.store.hash_del(&data_key(&self.name), task_id).await?;
        self.store.hash_del(&options_key(&self.name), task_id).await?;
        self.store.hash_del(&retries_key(&self.name), task_id).await?;
        Ok(())
    }

    /// Report a failed attempt (§4.F "Failure"). Retries up to the group's
    /// `retry_limit` by re-inserting into `order`; once exhausted, the task
    /// is handed to `queue_name`'s DLQ.
    ///
    /// The re-insertion score is `now + retry_delay_ms`, not `now` — a
    /// deliberate departure from an immediate re-insertion, so the task
    /// isn't eligible for reselection before its retry delay elapses without
    /// blocking this call (and the group lock) on a literal sleep.
    pub async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        queue_name: &str,
        now_ms: i64,
    ) -> Result<FailOutcome, QueueError> {
        let guard = self
            .lock
            .acquire_with_retry(&lock_key(&self.name), self.config.lock_ttl_ms, 3, 50)
            .await?;

        let result = async {
            let retry_count = self.store.hash_incr(&retries_key(&self.name), task_id, 1).await? as u32;

            if retry_count <= self.config.retry_limit {
                self.store.set_rem(&processing_key(&self.name), task_id).await?;
                self.store.hash_del(&processing_start_key(&self.name), task_id).await?;
                let due = now_ms + self.config.retry_delay_ms as i64;
                self.store.zadd(&order_key(&self.name), task_id, due as f64).await?;
                Ok::<(FailOutcome, Option<Task>), QueueError>((FailOutcome::Retrying { retry_count }, None))
            } else {
                let task = self.load_task(task_id, now_ms).await?;
                self.store.set_rem(&processing_key(&self.name), task_id).await?;
                self.store.hash_del(&processing_start_key(&self.name), task_id).await?;
                self.forget_task(task_id).await?;
                Ok((
                    FailOutcome::DeadLettered {
                        queue: queue_name.to_string(),
                    },
                    Some(task),
                ))
            }
        }
        .await;

        self.release_lock(&guard).await;
        let (outcome, task) = result?;
        self.refresh_stats().await?;

        match (&outcome, task) {
            (FailOutcome::DeadLettered { queue }, Some(task)) => {
                self.dlq_for(queue).add_failed_task(task, error.to_string()).await?;
                info!(group = %self.name, task_id, "group: retry budget exhausted, task dead-lettered");
            }
            (FailOutcome::Retrying { retry_count }, _) => {
                info!(group = %self.name, task_id, retry_count, "group: task scheduled for retry");
            }
            _ => {}
        }

        self.observer
            .notify(ObserverEvent::TaskFailed, task_id, "failed", Some(serde_json::json!({ "group": self.name, "error": error })))
            .await?;
        self.notify_group_change("failed").await;

        Ok(outcome)
    }

    /// Recover tasks stuck in `processing` longer than `max_ms` (§4.F /
    /// §6 health check) by routing them through the normal failure path.
    pub async fn recover_stuck_tasks(&self, now_ms: i64, max_ms: u64) -> Result<u32, QueueError> {
        let ids = self.store.set_members(&processing_key(&self.name)).await?;
        let mut recovered = 0;
        for id in ids {
            let started: Option<i64> = self
                .store
                .hash_get(&processing_start_key(&self.name), &id)
                .await?
                .and_then(|v| v.parse().ok());
            let Some(started) = started else { continue };
            if (now_ms - started) as u64 <= max_ms {
                continue;
            }
            let queue_name = self
                .store
                .hash_get(&options_key(&self.name), &id)
                .await?
                .and_then(|raw| serde_json::from_str::<TaskOptions>(&raw).ok())
                .map(|opts| opts.queue_name().to_string())
                .unwrap_or_else(|| "default".to_string());
            self.fail_task(&id, "stuck in processing past its timeout", &queue_name, now_ms)
                .await?;
            if let Err(e) = self
                .observer
                .notify(ObserverEvent::TaskStalled, &id, "stalled", Some(serde_json::json!({ "group": self.name })))
                .await
            {
                warn!(group = %self.name, task_id = %id, error = %e, "group: failed to publish stall event");
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!(group = %self.name, recovered, "group: recovered stuck tasks");
        }
        Ok(recovered)
    }

    /// Recompute and cache `{total, active, completed, failed, paused}`
    /// (§4.F `getStats`). `completed`/`failed` are lifetime counters tracked
    /// implicitly through the DLQ and queue state rather than duplicated
    /// here; this cache reports live membership only.
    async fn refresh_stats(&self) -> Result<GroupStats, QueueError> {
        let total = self.store.set_card(&tasks_key(&self.name)).await?;
        let active = self.store.set_card(&processing_key(&self.name)).await?;
        let stats = GroupStats {
            total,
            active,
            completed: 0,
            failed: 0,
            paused: 0,
        };
        self.store
            .hash_set(&stats_key(&self.name), "total", &stats.total.to_string())
            .await?;
        self.store
            .hash_set(&stats_key(&self.name), "active", &stats.active.to_string())
            .await?;
        crate::metrics::set_group_processing_size(&self.name, active as f64);
        Ok(stats)
    }

    pub async fn stats(&self) -> Result<GroupStats, QueueError> {
        let fields = self.store.hash_get_all(&stats_key(&self.name)).await?;
        Ok(GroupStats {
            total: fields.get("total").and_then(|v| v.parse().ok()).unwrap_or(0),
            active: fields.get("active").and_then(|v| v.parse().ok()).unwrap_or(0),
            completed: fields.get("completed").and_then(|v| v.parse().ok()).unwrap_or(0),
            failed: fields.get("failed").and_then(|v| v.parse().ok()).unwrap_or(0),
            paused: fields.get("paused").and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    /// Whether the group currently holds no tasks in any state, used by the
    /// manager's health loop to drop idle in-memory group handles (§4.G).
    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.store.set_card(&tasks_key(&self.name)).await? == 0)
    }

    /// Every task currently admitted to this group, in no particular order
    /// (§4.G `listGroupTasks`) — membership only, regardless of whether a
    /// task is waiting in `order` or already claimed into `processing`.
    pub async fn list_tasks(&self, now_ms: i64) -> Result<Vec<Task>, QueueError> {
        let ids = self.store.set_members(&tasks_key(&self.name)).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_task(&id, now_ms).await {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(group = %self.name, task_id = %id, error = %e, "group: failed to load task for listing"),
            }
        }
        Ok(tasks)
    }

    /// Tear down this group's structures entirely.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.close_loop();
        self.store.del(&tasks_key(&self.name)).await?;
        self.store.del(&order_key(&self.name)).await?;
        self.store.del(&processing_key(&self.name)).await?;
        self.store.del(&processing_start_key(&self.name)).await?;
        self.store.del(&options_key(&self.name)).await?;
        self.store.del(&data_key(&self.name)).await?;
        self.store.del(&method_key(&self.name)).await?;
        self.store.del(&retries_key(&self.name)).await?;
        self.store.del(&stats_key(&self.name)).await?;
        Ok(())
    }
}

fn chrono_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(tasks_key("g1"), "group:g1:tasks");
        assert_eq!(order_key("g1"), "group:g1:order");
        assert_eq!(lock_key("g1"), "group:g1:lock");
    }

    #[test]
    fn test_fail_outcome_equality() {
        assert_eq!(
            FailOutcome::Retrying { retry_count: 1 },
            FailOutcome::Retrying { retry_count: 1 }
        );
        assert_ne!(
            FailOutcome::Retrying { retry_count: 1 },
            FailOutcome::DeadLettered {
                queue: "default".to_string()
            }
        );
    }
}
