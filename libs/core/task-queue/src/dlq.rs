//! Dead Letter Queue (§4.C): holds tasks that exhausted their retry budget,
//! with reinjection and an alert-threshold counter.
//!
//! Entries are kept in a sorted set ordered by failure time plus one hash
//! per entry, mirroring the waiting/delayed-set-plus-hash shape [`crate::queue::Queue`]
//! uses — this crate has one convention for "ordered index + detail blob"
//! and the DLQ follows it rather than inventing a second one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::observer::{ObserverEvent, TaskObserver};
use crate::queue::Queue;
use crate::store::Store;
use crate::task::{Task, TaskErrorInfo, TaskState};

const RECENT_FAILURES_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

fn entries_key(queue: &str) -> String {
    format!("dlq:{queue}:entries")
}

fn entry_key(queue: &str, dlq_id: &str) -> String {
    format!("dlq:{queue}:entry:{dlq_id}")
}

fn failure_count_key(queue: &str) -> String {
    format!("dlq:{queue}:failure_count")
}

/// A failed task captured in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub task: Task,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

/// Snapshot of DLQ health for one queue (§4.C `getStats`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub queue: String,
    pub length: u64,
    pub total_failures: u64,
    /// Entries that failed within the last 24h (§4.C `getStats`), independent
    /// of `total_failures`, which is a lifetime counter that survives purges.
    pub recent_failures: u64,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    pub newest_failed_at: Option<DateTime<Utc>>,
    /// True once `total_failures` has crossed the configured alert threshold
    /// (§6 "DLQ alert threshold"); the caller decides what to do with it —
    /// this struct only reports the fact.
    pub alert_threshold_breached: bool,
}

pub struct DlqManager {
    store: Store,
    queue: String,
    alert_threshold: u64,
    observer: Arc<TaskObserver>,
}

impl DlqManager {
    pub fn new(store: Store, queue: impl Into<String>, alert_threshold: u64, observer: Arc<TaskObserver>) -> Self {
        Self {
            store,
            queue: queue.into(),
            alert_threshold,
            observer,
        }
    }

    /// Move a task that exhausted its retry budget into the DLQ (§4.F
    /// "Failure" hand-off). Increments the lifetime failure counter, which
    /// drives the alert threshold independent of how many entries are
    /// currently retained (entries can be purged; the counter is not).
    pub async fn add_failed_task(&self, mut task: Task, error: String) -> Result<DlqEntry, QueueError> {
        task.state = TaskState::Failed;
        task.error = Some(TaskErrorInfo {
            message: error.clone(),
            stack: None,
        });

        let failed_at = Utc::now();
        let dlq_id = format!("{}:{}", task.id, failed_at.timestamp_millis());
        let entry = DlqEntry {
            dlq_id: dlq_id.clone(),
            task,
            error,
            retry_count: 0,
            failed_at,
        };

        let json = serde_json::to_string(&entry)?;
        self.store
            .hash_set(&entry_key(&self.queue, &dlq_id), "json", &json)
            .await?;
        self.store
            .zadd(&entries_key(&self.queue), &dlq_id, failed_at.timestamp_millis() as f64)
            .await?;

        let total = self.store.hash_incr(&failure_count_key(&self.queue), "count", 1).await?;
        crate::metrics::set_dlq_total_failed(&self.queue, total as f64);

        if total as u64 == self.alert_threshold {
            warn!(queue = %self.queue, total, "dlq: alert threshold reached");
            if let Err(e) = self
                .observer
                .notify(
                    ObserverEvent::Alert,
                    &entry.task.id,
                    "dlq_alert",
                    Some(serde_json::json!({ "queue": self.queue, "totalFailures": total })),
                )
                .await
            {
                warn!(queue = %self.queue, error = %e, "dlq: failed to publish alert event");
            }
        }

        info!(task_id = %entry.task.id, dlq_id = %dlq_id, "dlq: task moved to dead-letter queue");
        Ok(entry)
    }

    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let length = self.store.zcard(&entries_key(&self.queue)).await?;
        let total_failures: u64 = self
            .store
            .hash_get(&failure_count_key(&self.queue), "count")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let oldest = self.store.zrange(&entries_key(&self.queue), 0, 0).await?;
        let newest = self.store.zrevrange(&entries_key(&self.queue), 0, 0).await?;

        let now_ms = Utc::now().timestamp_millis();
        let recent_failures = self
            .store
            .zcount(&entries_key(&self.queue), (now_ms - RECENT_FAILURES_WINDOW_MS) as f64, now_ms as f64)
            .await?;

        Ok(DlqStats {
            queue: self.queue.clone(),
            length,
            total_failures,
            recent_failures,
            oldest_failed_at: millis_to_datetime(oldest.first().map(|(_, s)| *s)),
            newest_failed_at: millis_to_datetime(newest.first().map(|(_, s)| *s)),
            alert_threshold_breached: total_failures >= self.alert_threshold,
        })
    }

    /// List the oldest `count` entries starting at `offset` (§4.C `list`).
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<DlqEntry>, QueueError> {
        let start = offset as isize;
        let stop = (offset + count).saturating_sub(1) as isize;
        let ids = self.store.zrange(&entries_key(&self.queue), start, stop).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            if let Some(entry) = self.get(&id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn get(&self, dlq_id: &str) -> Result<Option<DlqEntry>, QueueError> {
        let raw = self.store.hash_get(&entry_key(&self.queue, dlq_id), "json").await?;
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub async fn delete(&self, dlq_id: &str) -> Result<bool, QueueError> {
        let existed = self.store.exists(&entry_key(&self.queue, dlq_id)).await?;
        self.store.zrem(&entries_key(&self.queue), dlq_id).await?;
        self.store.del(&entry_key(&self.queue, dlq_id)).await?;
        debug!(dlq_id = %dlq_id, "dlq: entry deleted");
        Ok(existed)
    }

    /// Reinject a DLQ entry back into its originating queue with its retry
    /// count reset, then remove it from the DLQ (§4.C `retryTask`).
    pub async fn retry_task(&self, dlq_id: &str, queue: &Queue) -> Result<Option<Task>, QueueError> {
        let Some(mut entry) = self.get(dlq_id).await? else {
            return Ok(None);
        };
        entry.task.state = TaskState::Waiting;
        entry.task.retry_count = 0;
        entry.task.error = None;
        queue.add(&entry.task).await?;
        self.delete(dlq_id).await?;

        let remaining = self.store.hash_incr(&failure_count_key(&self.queue), "count", -1).await?;
        if remaining < 0 {
            self.store.hash_set(&failure_count_key(&self.queue), "count", "0").await?;
        }
        crate::metrics::set_dlq_total_failed(&self.queue, remaining.max(0) as f64);

        info!(task_id = %entry.task.id, dlq_id = %dlq_id, "dlq: task requeued");
        Ok(Some(entry.task))
    }

    /// Drop retained entries older than `max_age_ms` without touching the
    /// lifetime failure counter (§4.C `purgeOldEntries`).
    pub async fn purge_old_entries(&self, now_ms: i64, max_age_ms: i64) -> Result<u64, QueueError> {
        let cutoff = (now_ms - max_age_ms) as f64;
        let stale = self.store.zrange(&entries_key(&self.queue), 0, -1).await?;
        let mut purged = 0;
        for (id, score) in stale {
            if score <= cutoff {
                self.store.zrem(&entries_key(&self.queue), &id).await?;
                self.store.del(&entry_key(&self.queue, &id)).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(queue = %self.queue, purged, "dlq: purged stale entries");
        }
        Ok(purged)
    }

    pub async fn purge_all(&self) -> Result<u64, QueueError> {
        let ids = self.store.zrange(&entries_key(&self.queue), 0, -1).await?;
        let count = ids.len() as u64;
        for (id, _) in ids {
            self.store.del(&entry_key(&self.queue, &id)).await?;
        }
        self.store.del(&entries_key(&self.queue)).await?;
        info!(queue = %self.queue, count, "dlq: purged all entries");
        Ok(count)
    }
}

fn millis_to_datetime(ms: Option<f64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use serde_json::Value;

    #[test]
    fn test_key_naming() {
        assert_eq!(entries_key("default"), "dlq:default:entries");
        assert_eq!(entry_key("default", "echo-1:100"), "dlq:default:entry:echo-1:100");
    }

    #[test]
    fn test_dlq_entry_round_trips_json() {
        let task = Task::new("echo", Value::Null, TaskOptions::default(), 0);
        let entry = DlqEntry {
            dlq_id: format!("{}:0", task.id),
            task,
            error: "boom".to_string(),
            retry_count: 3,
            failed_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: DlqEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dlq_id, entry.dlq_id);
        assert_eq!(back.retry_count, 3);
    }
}
