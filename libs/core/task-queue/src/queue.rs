//! Queue (§4.D): the plain (non-grouped) waiting/delayed structure a
//! [`crate::worker::Worker`] claims tasks from.
//!
//! Waiting tasks live in a sorted set keyed by [`crate::task::composite_score`]
//! so claim order matches a group's FIFO/PRIORITY ordering without a second
//! code path. Delayed/scheduled tasks live in a second sorted set keyed by
//! due-epoch and are promoted into the waiting set by a sweep that runs
//! before every claim — the due-time analogue of the now-deleted consumer's
//! pending-entry claim loop, generalized away from stream semantics.

use once_cell::sync::Lazy;
use redis::Script;
use serde_json::Value;
use tracing::debug;

use crate::error::QueueError;
use crate::store::Store;
use crate::task::{composite_score, Task, TaskOptions, TaskState};

fn waiting_key(queue: &str) -> String {
    format!("queue:{queue}:waiting")
}

fn delayed_key(queue: &str) -> String {
    format!("queue:{queue}:delayed")
}

fn active_key(queue: &str) -> String {
    format!("queue:{queue}:active")
}

fn task_key(queue: &str, task_id: &str) -> String {
    format!("queue:{queue}:task:{task_id}")
}

fn tasks_index_key(queue: &str) -> String {
    format!("queue:{queue}:tasks")
}

/// Atomically pop the lowest-scoring member of `KEYS[1]` (§4.D `claim_next`).
/// A plain `ZRANGE` read followed by a separate `ZREM` would let two worker
/// processes claiming from the same queue both see the same candidate before
/// either removes it — a cross-process double-dispatch, not the idempotent
/// at-least-once duplication the retry path allows for.
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ids = redis.call("ZRANGE", KEYS[1], 0, 0)
        if #ids == 0 then
            return false
        end
        redis.call("ZREM", KEYS[1], ids[1])
        return ids[1]
        "#,
    )
});

/// A handle to one named queue's structure in the store. Stateless beyond
/// its name — all state lives in Redis, so cloning/creating fresh handles
/// for the same name is always safe.
#[derive(Clone)]
pub struct Queue {
    store: Store,
    name: String,
}

impl Queue {
    pub fn new(store: Store, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a task (§4.D `add`). Immediate tasks land straight in the
    /// waiting set; tasks carrying `options.schedule.start_at` in the future
    /// go to the delayed set instead and are promoted once due.
    pub async fn add(&self, task: &Task) -> Result<(), QueueError> {
        self.persist(task).await?;

        let due_at = task
            .options
            .schedule
            .as_ref()
            .and_then(|s| s.start_at)
            .filter(|&start| start > task.created_at);

        match due_at {
            Some(due) => {
                self.store.zadd(&delayed_key(&self.name), &task.id, due as f64).await?;
                debug!(task_id = %task.id, queue = %self.name, due, "queue: task delayed");
            }
            None => {
                let score = composite_score(task.options.priority, task.options.weight, task.created_at);
                self.store.zadd(&waiting_key(&self.name), &task.id, score).await?;
                debug!(task_id = %task.id, queue = %self.name, score, "queue: task waiting");
            }
        }
        Ok(())
    }

    /// Upsert a recurring task definition under its own stable id, replacing
    /// any prior waiting/delayed entry with the same id (§3 `schedule`).
    pub async fn upsert_scheduled_job(&self, task: &Task) -> Result<(), QueueError> {
        self.store.zrem(&waiting_key(&self.name), &task.id).await?;
        self.store.zrem(&delayed_key(&self.name), &task.id).await?;
        self.add(task).await
    }

    /// Requeue a failed task into the delayed set at an explicit due time,
    /// bypassing `options.schedule` (§4.E retry-with-backoff). Unlike
    /// [`Queue::add`], this never consults `options.schedule.start_at` —
    /// the due time here is the computed retry delay, not the task's own
    /// recurrence.
    pub async fn schedule_retry(&self, task: &Task, due_at_ms: i64) -> Result<(), QueueError> {
        self.persist(task).await?;
        self.store.zadd(&delayed_key(&self.name), &task.id, due_at_ms as f64).await?;
        self.clear_active(&task.id).await;
        Ok(())
    }

    /// Drop a task's `active` bookkeeping entry, if any. Best-effort: a
    /// missed `ZREM` here only means the stuck-task sweep takes one more
    /// pass to notice the entry is already gone from its own timeout window.
    async fn clear_active(&self, task_id: &str) {
        let _ = self.store.zrem(&active_key(&self.name), task_id).await;
    }

    async fn persist(&self, task: &Task) -> Result<(), QueueError> {
        let json = serde_json::to_string(task)?;
        self.store.hash_set(&task_key(&self.name, &task.id), "json", &json).await?;
        self.store.set_add(&tasks_index_key(&self.name), &task.id).await?;
        Ok(())
    }

    pub async fn get_job(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        let raw = self.store.hash_get(&task_key(&self.name, task_id), "json").await?;
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub async fn get_jobs(&self) -> Result<Vec<Task>, QueueError> {
        let ids = self.store.set_members(&tasks_index_key(&self.name)).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get_job(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Persist a state/result/error update in place, without touching the
    /// waiting/delayed membership (callers remove the task from those sets
    /// separately once it is claimed/completed). Clears the `active`
    /// bookkeeping entry whenever the task is no longer `Active`, so a
    /// completed-but-kept task (`RemoveOnComplete::Keep`/`Never`) doesn't
    /// linger in the stuck-task sweep's scan forever.
    pub async fn save_job(&self, task: &Task) -> Result<(), QueueError> {
        self.persist(task).await?;
        if task.state != TaskState::Active {
            self.clear_active(&task.id).await;
        }
        Ok(())
    }

    pub async fn remove_job(&self, task_id: &str) -> Result<(), QueueError> {
        self.store.zrem(&waiting_key(&self.name), task_id).await?;
        self.store.zrem(&delayed_key(&self.name), task_id).await?;
        self.store.set_rem(&tasks_index_key(&self.name), task_id).await?;
        self.store.del(&task_key(&self.name, task_id)).await?;
        self.clear_active(task_id).await;
        Ok(())
    }

    /// Promote due delayed tasks into the waiting set. Called before every
    /// claim attempt (§4.D, §9 "delayed jobs promoted by a sweep").
    pub async fn promote_due(&self, now_ms: i64) -> Result<u64, QueueError> {
        let due = self.store.zrange(&delayed_key(&self.name), 0, -1).await?;
        let mut promoted = 0;
        for (id, due_at) in due {
            if due_at > now_ms as f64 {
                continue;
            }
            if let Some(task) = self.get_job(&id).await? {
                self.store.zrem(&delayed_key(&self.name), &id).await?;
                let score = composite_score(task.options.priority, task.options.weight, now_ms);
                self.store.zadd(&waiting_key(&self.name), &id, score).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Claim the lowest-scoring waiting task (FIFO by composite score) and
    /// mark it active. Returns `None` if the queue is empty. The pop itself
    /// runs as a single Lua script (`CLAIM_SCRIPT`) so two worker processes
    /// racing on the same queue can never both claim the same id.
    pub async fn claim_next(&self, now_ms: i64) -> Result<Option<Task>, QueueError> {
        self.promote_due(now_ms).await?;

        let claimed: Option<String> = self
            .store
            .eval_script(&CLAIM_SCRIPT, &[waiting_key(&self.name)], &[])
            .await?;
        let Some(task_id) = claimed else {
            return Ok(None);
        };

        self.store.zadd(&active_key(&self.name), &task_id, now_ms as f64).await?;
        let Some(mut task) = self.get_job(&task_id).await? else {
            return Ok(None);
        };
        task.state = TaskState::Active;
        task.updated_at = now_ms;
        self.persist(&task).await?;
        Ok(Some(task))
    }

    /// Reclaim tasks that have sat `Active` in this queue past `max_ms`
    /// (§4.D, §6 health check) — the non-grouped analogue of
    /// `GroupEngine::recover_stuck_tasks`. Membership in the `active` set is
    /// small enough in practice to scan in full rather than indexing by
    /// score range with a second round-trip.
    pub async fn stale_active(&self, now_ms: i64, max_ms: u64) -> Result<Vec<Task>, QueueError> {
        let entries = self.store.zrange(&active_key(&self.name), 0, -1).await?;
        let mut stale = Vec::new();
        for (id, started_at) in entries {
            if (now_ms as f64 - started_at) <= max_ms as f64 {
                continue;
            }
            self.store.zrem(&active_key(&self.name), &id).await?;
            if let Some(task) = self.get_job(&id).await? {
                if task.state == TaskState::Active {
                    stale.push(task);
                }
            }
        }
        Ok(stale)
    }

    /// The `n` longest-waiting tasks, oldest first (§6 `averageWaitingTime`
    /// sampling — the manager's metrics loop averages over these instead of
    /// walking the whole waiting set).
    pub async fn oldest_waiting(&self, n: usize) -> Result<Vec<Task>, QueueError> {
        let candidates = self
            .store
            .zrange(&waiting_key(&self.name), 0, n.saturating_sub(1) as isize)
            .await?;
        let mut tasks = Vec::with_capacity(candidates.len());
        for (id, _) in candidates {
            if let Some(task) = self.get_job(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub async fn waiting_count(&self) -> Result<u64, QueueError> {
        self.store.zcard(&waiting_key(&self.name)).await
    }

    pub async fn delayed_count(&self) -> Result<u64, QueueError> {
        self.store.zcard(&delayed_key(&self.name)).await
    }

    /// Counts by state across every tracked task, regardless of
    /// waiting/delayed-set membership (§6 per-queue counts).
    pub async fn counts_by_state(&self) -> Result<Vec<(TaskState, u64)>, QueueError> {
        let tasks = self.get_jobs().await?;
        let mut waiting = 0;
        let mut active = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut delayed = 0;
        let mut paused = 0;
        let mut waiting_children = 0;
        let mut unknown = 0;
        for task in tasks {
            match task.state {
                TaskState::Waiting => waiting += 1,
                TaskState::Active => active += 1,
                TaskState::Completed => completed += 1,
                TaskState::Failed => failed += 1,
                TaskState::Delayed => delayed += 1,
                TaskState::Paused => paused += 1,
                TaskState::WaitingChildren => waiting_children += 1,
                TaskState::Unknown => unknown += 1,
            }
        }
        Ok(vec![
            (TaskState::Waiting, waiting),
            (TaskState::Active, active),
            (TaskState::Completed, completed),
            (TaskState::Failed, failed),
            (TaskState::Delayed, delayed),
            (TaskState::Paused, paused),
            (TaskState::WaitingChildren, waiting_children),
            (TaskState::Unknown, unknown),
        ])
    }

    /// Tear down this queue's structures entirely (§4.G `close`).
    pub async fn close(&self) -> Result<(), QueueError> {
        self.store.del(&waiting_key(&self.name)).await?;
        self.store.del(&delayed_key(&self.name)).await?;
        self.store.del(&active_key(&self.name)).await?;
        let ids = self.store.set_members(&tasks_index_key(&self.name)).await?;
        for id in ids {
            self.store.del(&task_key(&self.name, &id)).await?;
        }
        self.store.del(&tasks_index_key(&self.name)).await?;
        Ok(())
    }
}

/// Build the task submitted through [`crate::manager::QueueManager::add_task`]
/// before it's handed to a [`Queue`] or group — shared helper so both entry
/// points construct tasks identically.
pub fn build_task(name: impl Into<String>, data: Value, options: TaskOptions, now_ms: i64) -> Task {
    Task::new(name, data, options, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(waiting_key("default"), "queue:default:waiting");
        assert_eq!(delayed_key("default"), "queue:default:delayed");
        assert_eq!(active_key("default"), "queue:default:active");
        assert_eq!(task_key("default", "echo-1"), "queue:default:task:echo-1");
    }

    #[test]
    fn test_build_task_uses_provided_options() {
        let opts = TaskOptions {
            priority: 5,
            ..Default::default()
        };
        let task = build_task("echo", Value::Null, opts, 1000);
        assert_eq!(task.options.priority, 5);
        assert_eq!(task.created_at, 1000);
    }
}
