//! Queue Manager (§4.G): the facade a caller submits tasks through, and the
//! component that owns queue/group lifecycle, periodic metrics snapshots,
//! and periodic stuck-task recovery.
//!
//! Shape: one struct holding `Arc<RwLock<HashMap<...>>>` caches of its
//! sub-components plus a couple of background timers, rather than a
//! trait-object registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GroupDefaults, QueueDefaults, RuntimeConfig};
use crate::dlq::DlqManager;
use crate::error::QueueError;
use crate::group::{GroupEngine, GroupRegistry};
use crate::observer::{ObserverEvent, TaskObserver};
use crate::queue::{build_task, Queue};
use crate::store::Store;
use crate::task::{Task, TaskOptions};
use crate::worker::{self, WorkerHandle};

fn queues_set_key() -> &'static str {
    "queues:set"
}

fn groups_set_key() -> &'static str {
    "groups:set"
}

fn queue_meta_key(name: &str) -> String {
    format!("queue:meta:{name}")
}

fn queue_config_key(name: &str) -> String {
    format!("queue:config:{name}")
}

fn queue_metrics_key(name: &str) -> String {
    format!("queue:metrics:{name}")
}

fn queue_metrics_detail_key(name: &str) -> String {
    format!("queue:metrics:{name}:detail")
}

fn group_priorities_key() -> &'static str {
    "group:priorities"
}

const METRICS_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const WAITING_SAMPLE_SIZE: usize = 10;
/// Floor for stuck-task recovery when a group's own `timeout_ms` is smaller
/// than is sensible to scan on — health checks run at a coarser cadence than
/// any individual task's timeout.
const MIN_STUCK_RECOVERY_MS: u64 = 30_000;

/// Serializable snapshot of a queue's per-tick health, persisted to
/// `queue:metrics:<name>` (§6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct QueueMetricsSnapshot {
    timestamp: i64,
    waiting: u64,
    delayed: u64,
    average_waiting_ms: f64,
}

/// A queue's identity and last-known activity (§4.G `getQueueMeta`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueMeta {
    pub name: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub instance_id: String,
}

/// Facade over queues, groups, and the DLQ (§4.G). One instance per
/// `instance_id` process (§9 "one facade per named instanceId" — no module
/// singleton).
pub struct QueueManager {
    store: Store,
    config: RuntimeConfig,
    observer: Arc<TaskObserver>,
    queues: Arc<RwLock<HashMap<String, Queue>>>,
    groups: GroupRegistry,
    shutdown: watch::Sender<bool>,
}

impl QueueManager {
    pub fn new(store: Store, config: RuntimeConfig) -> Self {
        let observer = Arc::new(TaskObserver::new(store.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            observer,
            queues: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn observer(&self) -> Arc<TaskObserver> {
        self.observer.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn groups(&self) -> GroupRegistry {
        self.groups.clone()
    }

    fn dlq_for(&self, queue: &str) -> DlqManager {
        DlqManager::new(self.store.clone(), queue, self.config.dlq.alert_threshold, self.observer.clone())
    }

    /// Submit a task (§4.G `addTask`). Routes to the target group if
    /// `options.group` is set, otherwise straight into the named queue.
    pub async fn add_task(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Result<Task, QueueError> {
        let now_ms = now_ms();
        if options.group.is_some() {
            return self.add_task_to_group(name, data, options).await;
        }

        let queue_name = options.queue_name().to_string();
        self.create_queue_if_absent(&queue_name, None).await?;
        let queue = self.get_queue(&queue_name).await?;

        let task = build_task(name, data, options, now_ms);
        if task.options.schedule.is_some() {
            queue.upsert_scheduled_job(&task).await?;
        } else {
            queue.add(&task).await?;
        }

        self.touch_queue_activity(&queue_name, now_ms).await?;
        self.observer
            .notify(ObserverEvent::TaskAdded, &task.id, "waiting", None)
            .await?;
        Ok(task)
    }

    /// Submit a task into a group (§4.G `addTaskToGroup`). Lazily creates
    /// the `GroupEngine` the first time this group name is seen.
    pub async fn add_task_to_group(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Result<Task, QueueError> {
        let group_name = options
            .group
            .clone()
            .ok_or_else(|| QueueError::Config("addTaskToGroup called without options.group".to_string()))?;

        self.create_queue_if_absent(options.queue_name(), None).await?;
        let engine = self.get_or_create_group(&group_name).await?;
        engine.add_task(name, data, options, now_ms()).await
    }

    /// Create a queue explicitly (§4.G `createQueue`), recording its config
    /// so it can be rehydrated by another process sharing the same store.
    pub async fn create_queue(&self, name: &str, defaults: QueueDefaults) -> Result<Queue, QueueError> {
        self.create_queue_if_absent(name, Some(defaults)).await?;
        self.get_queue(name).await
    }

    async fn create_queue_if_absent(&self, name: &str, defaults: Option<QueueDefaults>) -> Result<(), QueueError> {
        if self.queues.read().await.contains_key(name) {
            return Ok(());
        }
        let defaults = Some(defaults.unwrap_or_else(|| self.config.queue_defaults_for(name)));

        let now = now_ms();
        self.store.set_add(queues_set_key(), name).await?;
        self.store
            .hash_set(&queue_meta_key(name), "createdAt", &now.to_string())
            .await?;
        self.store
            .hash_set(&queue_meta_key(name), "lastActivity", &now.to_string())
            .await?;
        self.store
            .hash_set(&queue_meta_key(name), "instanceId", &self.config.instance_id)
            .await?;

        if let Some(defaults) = defaults {
            self.store
                .hash_set(&queue_config_key(name), "concurrency", &defaults.concurrency.to_string())
                .await?;
            self.store
                .hash_set(&queue_config_key(name), "maxRetries", &defaults.max_retries.to_string())
                .await?;
            self.store
                .hash_set(&queue_config_key(name), "retryDelayMs", &defaults.retry_delay_ms.to_string())
                .await?;
            self.store
                .hash_set(&queue_config_key(name), "timeoutMs", &defaults.timeout_ms.to_string())
                .await?;
        }

        let queue = Queue::new(self.store.clone(), name.to_string());
        self.queues.write().await.insert(name.to_string(), queue);
        info!(queue = name, "manager: queue created");
        Ok(())
    }

    /// Fetch a live `Queue` handle, rehydrating the in-memory cache entry if
    /// this process hasn't seen this name yet (§4.G `getQueue`).
    pub async fn get_queue(&self, name: &str) -> Result<Queue, QueueError> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return Ok(queue.clone());
        }
        self.create_queue_if_absent(name, None).await?;
        Ok(self.queues.read().await.get(name).cloned().expect("just inserted"))
    }

    async fn touch_queue_activity(&self, name: &str, now_ms: i64) -> Result<(), QueueError> {
        self.store
            .hash_set(&queue_meta_key(name), "lastActivity", &now_ms.to_string())
            .await
    }

    async fn get_or_create_group(&self, name: &str) -> Result<Arc<GroupEngine>, QueueError> {
        if let Some(engine) = self.groups.read().await.get(name) {
            return Ok(engine.clone());
        }

        let priority: i64 = self
            .store
            .hash_get(group_priorities_key(), name)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut defaults = self.config.group_defaults_for(name);
        defaults.priority = priority;

        let engine = Arc::new(GroupEngine::new(
            self.store.clone(),
            name.to_string(),
            defaults,
            self.observer.clone(),
            self.config.dlq.alert_threshold,
        ));
        engine.spawn_promotion_loop();
        self.groups.write().await.insert(name.to_string(), engine.clone());
        self.store.set_add(groups_set_key(), name).await?;
        info!(group = name, "manager: group engine created");
        Ok(engine)
    }

    pub async fn get_task(&self, queue_name: &str, task_id: &str) -> Result<Option<Task>, QueueError> {
        self.get_queue(queue_name).await?.get_job(task_id).await
    }

    pub async fn remove_task(&self, queue_name: &str, task_id: &str) -> Result<(), QueueError> {
        self.get_queue(queue_name).await?.remove_job(task_id).await
    }

    pub async fn get_queue_tasks(&self, queue_name: &str) -> Result<Vec<Task>, QueueError> {
        self.get_queue(queue_name).await?.get_jobs().await
    }

    pub async fn get_all_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let names = self.store.set_members(queues_set_key()).await?;
        let mut all = Vec::new();
        for name in names {
            all.extend(self.get_queue_tasks(&name).await?);
        }
        Ok(all)
    }

    /// Override a group's priority (§4.G `setGroupPriority`), persisted so
    /// every process sharing the store picks it up, and applied immediately
    /// to this process's in-memory handle if one already exists.
    pub async fn set_group_priority(&self, group: &str, priority: i64) -> Result<(), QueueError> {
        self.store
            .hash_set(group_priorities_key(), group, &priority.to_string())
            .await?;
        if self.groups.read().await.contains_key(group) {
            // Re-creating the handle picks up the new priority on next use;
            // an in-flight selection keeps running against the old value,
            // which is fine — priority affects admission ordering, not safety.
            self.groups.write().await.remove(group);
        }
        Ok(())
    }

    pub async fn get_group_priority(&self, group: &str) -> Result<i64, QueueError> {
        Ok(self
            .store
            .hash_get(group_priorities_key(), group)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn group_stats(&self, group: &str) -> Result<crate::group::GroupStats, QueueError> {
        self.get_or_create_group(group).await?.stats().await
    }

    /// Every queue name ever created on this store, not just the ones this
    /// process has a live `Queue` handle for (§4.G `listQueues`).
    pub async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        self.store.set_members(queues_set_key()).await
    }

    /// Every group name ever created on this store (§4.G `listGroups`) — a
    /// group that has gone idle and had its in-memory engine dropped by the
    /// health loop still appears here, since membership in `groups:set`
    /// outlives the in-process cache.
    pub async fn list_groups(&self) -> Result<Vec<String>, QueueError> {
        self.store.set_members(groups_set_key()).await
    }

    pub async fn list_group_tasks(&self, group: &str) -> Result<Vec<Task>, QueueError> {
        self.get_or_create_group(group).await?.list_tasks(now_ms()).await
    }

    /// A queue's identity and activity timestamps, persisted at creation and
    /// touched on every `addTask` (§4.G `getQueueMeta`). `None` if the queue
    /// has never been created on this store.
    pub async fn queue_meta(&self, name: &str) -> Result<Option<QueueMeta>, QueueError> {
        let fields = self.store.hash_get_all(&queue_meta_key(name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(QueueMeta {
            name: name.to_string(),
            created_at: fields.get("createdAt").and_then(|v| v.parse().ok()).unwrap_or(0),
            last_activity: fields.get("lastActivity").and_then(|v| v.parse().ok()).unwrap_or(0),
            instance_id: fields.get("instanceId").cloned().unwrap_or_default(),
        }))
    }

    /// Every worker that has ever registered on this store, across every
    /// queue (§4.G `listWorkers`).
    pub async fn list_workers(&self) -> Result<Vec<WorkerHandle>, QueueError> {
        let ids = self.store.set_members(worker::workers_set_key()).await?;
        Ok(ids.into_iter().map(|id| WorkerHandle::new(self.store.clone(), id)).collect())
    }

    /// Workers currently (or formerly) attached to one specific queue.
    pub async fn queue_workers(&self, queue: &str) -> Result<Vec<WorkerHandle>, QueueError> {
        let ids = self.store.set_members(&worker::queue_workers_key(queue)).await?;
        Ok(ids.into_iter().map(|id| WorkerHandle::new(self.store.clone(), id)).collect())
    }

    pub fn worker_handle(&self, id: &str) -> WorkerHandle {
        WorkerHandle::new(self.store.clone(), id.to_string())
    }

    /// Start the periodic metrics-collection and health-check loops (§4.G,
    /// §6). Returns immediately; both loops run until [`QueueManager::close`]
    /// is called.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let manager = self.clone();
        let mut shutdown = manager.shutdown.subscribe();
        let interval_ms = manager.config.metrics_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        if let Err(e) = manager.collect_metrics().await {
                            warn!(error = %e, "manager: metrics collection failed");
                        }
                    }
                }
            }
        });

        let manager = self.clone();
        let mut shutdown = manager.shutdown.subscribe();
        let interval_ms = manager.config.health_check_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = ticker.tick() => {
                        if let Err(e) = manager.run_health_check().await {
                            warn!(error = %e, "manager: health check failed");
                        }
                    }
                }
            }
        });
    }

    /// One tick of the metrics loop (§6): per-queue waiting/delayed counts
    /// plus an `averageWaitingTime` proxy sampled over the `WAITING_SAMPLE_SIZE`
    /// oldest waiting tasks, snapshotted into a capped-retention sorted set.
    async fn collect_metrics(&self) -> Result<(), QueueError> {
        let now = now_ms();
        let names = self.store.set_members(queues_set_key()).await?;
        for name in names {
            let queue = self.get_queue(&name).await?;
            let waiting = queue.waiting_count().await?;
            let delayed = queue.delayed_count().await?;
            let sample = queue.oldest_waiting(WAITING_SAMPLE_SIZE).await?;
            let average_waiting_ms = if sample.is_empty() {
                0.0
            } else {
                let total: i64 = sample.iter().map(|t| (now - t.created_at).max(0)).sum();
                total as f64 / sample.len() as f64
            };

            crate::metrics::set_queue_waiting_size(&name, waiting as f64);

            let snapshot = QueueMetricsSnapshot {
                timestamp: now,
                waiting,
                delayed,
                average_waiting_ms,
            };
            let json = serde_json::to_string(&snapshot)?;
            // The zset member must be unique per tick, not just per value —
            // two snapshots with identical waiting/delayed/average at the
            // same millisecond would otherwise collapse into one entry.
            let member = format!("{now}:{}", Uuid::new_v4());
            self.store.zadd(&queue_metrics_key(&name), &member, now as f64).await?;
            self.store.hash_set(&queue_metrics_detail_key(&name), &member, &json).await?;

            let cutoff = (now - METRICS_RETENTION_MS) as f64;
            let stale = self.store.zrange(&queue_metrics_key(&name), 0, -1).await?;
            for (stale_member, score) in stale {
                if score > cutoff {
                    break;
                }
                self.store.hash_del(&queue_metrics_detail_key(&name), &stale_member).await?;
            }
            self.store.zremrangebyscore(&queue_metrics_key(&name), f64::MIN, cutoff).await?;
        }
        debug!("manager: metrics snapshot collected");
        Ok(())
    }

    /// One tick of the health-check loop (§6): recover stuck group tasks,
    /// drop in-memory handles for groups that have gone idle, and reclaim
    /// plain-queue tasks stuck `Active` past their timeout — the ungrouped
    /// analogue of group recovery, since a `Queue` has no promotion loop of
    /// its own to notice a crashed worker mid-attempt.
    async fn run_health_check(&self) -> Result<(), QueueError> {
        let now = now_ms();
        let names: Vec<String> = self.groups.read().await.keys().cloned().collect();
        for name in names {
            let Some(engine) = self.groups.read().await.get(&name).cloned() else {
                continue;
            };
            let max_ms = engine.config().timeout_ms.max(MIN_STUCK_RECOVERY_MS);
            let recovered = engine.recover_stuck_tasks(now, max_ms).await?;
            if recovered > 0 {
                info!(group = %name, recovered, "manager: recovered stuck tasks");
            }
            if engine.is_empty().await? {
                engine.close_loop();
                self.groups.write().await.remove(&name);
                debug!(group = %name, "manager: dropped idle group handle");
            }
        }

        let queue_names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        for name in queue_names {
            self.recover_stuck_queue_tasks(&name, now).await?;
        }
        Ok(())
    }

    /// Reclaim one queue's tasks stuck `Active` past its timeout, applying
    /// the same retry/backoff/DLQ decision a worker would have made on
    /// attempt failure (`resolve_retry`), since the worker that claimed them
    /// is presumed dead rather than merely slow.
    async fn recover_stuck_queue_tasks(&self, name: &str, now: i64) -> Result<(), QueueError> {
        let queue = self.get_queue(name).await?;
        let defaults = self.config.queue_defaults_for(name);
        let max_ms = defaults.timeout_ms.max(MIN_STUCK_RECOVERY_MS);
        let stale = queue.stale_active(now, max_ms).await?;

        for mut task in stale {
            warn!(queue = name, task_id = %task.id, "manager: reclaimed stuck queue task");
            if let Err(e) = self
                .observer
                .notify(ObserverEvent::TaskStalled, &task.id, "stalled", Some(serde_json::json!({ "queue": name })))
                .await
            {
                warn!(queue = name, task_id = %task.id, error = %e, "manager: failed to publish stall event");
            }

            match crate::worker::resolve_retry(&mut task, &defaults, now) {
                crate::worker::RetryDecision::Retry { due_at_ms } => {
                    queue.schedule_retry(&task, due_at_ms).await?;
                }
                crate::worker::RetryDecision::Exhausted => {
                    self.dlq_for(name).add_failed_task(task.clone(), "stuck in active past its timeout".to_string()).await?;
                    queue.remove_job(&task.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Stop the background loops and close the observer and every known
    /// queue (§5 "global shutdown").
    pub async fn close(&self) -> Result<(), QueueError> {
        let _ = self.shutdown.send(true);
        for engine in self.groups.read().await.values() {
            engine.close_loop();
        }
        self.observer.close().await;
        let names = self.store.set_members(queues_set_key()).await?;
        for name in names {
            self.get_queue(&name).await?.close().await?;
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(queue_meta_key("default"), "queue:meta:default");
        assert_eq!(queue_metrics_key("default"), "queue:metrics:default");
        assert_eq!(queue_metrics_detail_key("default"), "queue:metrics:default:detail");
        assert_eq!(group_priorities_key(), "group:priorities");
        assert_eq!(groups_set_key(), "groups:set");
    }
}
