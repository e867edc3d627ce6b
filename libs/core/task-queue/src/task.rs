//! The `Task` entity, its submission options, and the composite ordering
//! score used by both plain queues and groups (§3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::Backoff;

/// Lifecycle state of a task. This spec adopts the second of the source's
/// two divergent `TaskState` definitions (§9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    WaitingChildren,
    Unknown,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Waiting
    }
}

/// Retention policy for a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveOnComplete {
    Never,
    Always,
    Keep { age_secs: Option<u64>, count: Option<u64> },
}

impl Default for RemoveOnComplete {
    fn default() -> Self {
        Self::Always
    }
}

/// A cron-style recurrence for a repeating task (`TaskOptions.schedule`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
}

/// Group-level rate limit override carried on an individual submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub max: u32,
    pub duration_ms: u64,
}

/// Per-submission configuration (§3). Every field is optional at the call
/// site; `QueueManager`/`GroupEngine` fill in queue/group defaults for
/// anything left unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    pub id: Option<String>,
    pub priority: i64,
    pub queue: Option<String>,
    pub group: Option<String>,
    pub weight: i64,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub timeout_ms: Option<u64>,
    pub schedule: Option<Schedule>,
    pub remove_on_complete: Option<RemoveOnComplete>,
    pub rate_limit: Option<RateLimitOverride>,
}

impl TaskOptions {
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }
}

/// The unit of work (§3). `data` is an opaque JSON value — typed wrappers
/// belong to user code (§9 "dynamically typed task payloads").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub options: TaskOptions,
    pub state: TaskState,
    pub retry_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub result: Option<Value>,
    pub error: Option<TaskErrorInfo>,
    pub group: Option<String>,
    /// 0-100 (§4.B `ProgressUpdate`). Reset to 0 on dispatch, set to 100 on
    /// success; a handler can report intermediate values via the observer.
    pub progress: u8,
}

/// Captured failure detail, also the shape stored in DLQ entries (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub message: String,
    pub stack: Option<String>,
}

impl Task {
    /// Build a new task, generating `id` as `"<name>-<uuidv4>"` unless one
    /// was supplied in `options.id`.
    pub fn new(name: impl Into<String>, data: Value, options: TaskOptions, now_ms: i64) -> Self {
        let name = name.into();
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{name}-{}", Uuid::new_v4()));
        let group = options.group.clone();
        Self {
            id,
            name,
            data,
            options,
            state: TaskState::Waiting,
            retry_count: 0,
            created_at: now_ms,
            updated_at: now_ms,
            result: None,
            error: None,
            group,
            progress: 0,
        }
    }

    /// Unwrap one level of `data.data`, per §9's documented (not conditional)
    /// quirk: a handler always receives the inner payload if the submitted
    /// data was itself shaped `{ data: ... }`.
    pub fn handler_payload(&self) -> &Value {
        match self.data.get("data") {
            Some(inner) => inner,
            None => &self.data,
        }
    }
}

/// The composite ordering score used inside a group's `order` sorted set
/// (§3 GLOSSARY): `priority·10¹² + weight·10¹⁰ + enqueueEpochMs`.
///
/// Lower sorts earlier under FIFO; `PRIORITY` selects the highest score.
/// Ties are broken by insertion epoch because it is the low-order term.
pub fn composite_score(priority: i64, weight: i64, enqueue_epoch_ms: i64) -> f64 {
    (priority as f64) * 1e12 + (weight as f64) * 1e10 + (enqueue_epoch_ms as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_defaults_to_name_uuid() {
        let task = Task::new("echo", Value::Null, TaskOptions::default(), 0);
        assert!(task.id.starts_with("echo-"));
    }

    #[test]
    fn test_task_id_honors_explicit_id() {
        let opts = TaskOptions {
            id: Some("my-id".to_string()),
            ..Default::default()
        };
        let task = Task::new("echo", Value::Null, opts, 0);
        assert_eq!(task.id, "my-id");
    }

    #[test]
    fn test_handler_payload_unwraps_one_level() {
        let data = serde_json::json!({ "data": { "args": ["hi"] } });
        let task = Task::new("echo", data, TaskOptions::default(), 0);
        assert_eq!(task.handler_payload(), &serde_json::json!({ "args": ["hi"] }));
    }

    #[test]
    fn test_handler_payload_passthrough_without_wrapper() {
        let data = serde_json::json!({ "args": ["hi"] });
        let task = Task::new("echo", data.clone(), TaskOptions::default(), 0);
        assert_eq!(task.handler_payload(), &data);
    }

    #[test]
    fn test_composite_score_orders_by_priority_first() {
        let low_priority = composite_score(1, 0, 1_000_000);
        let high_priority = composite_score(10, 0, 0);
        assert!(high_priority > low_priority);
    }

    #[test]
    fn test_composite_score_ties_broken_by_epoch() {
        let earlier = composite_score(5, 0, 100);
        let later = composite_score(5, 0, 200);
        assert!(earlier < later);
    }
}
