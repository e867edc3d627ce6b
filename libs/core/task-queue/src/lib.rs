//! Distributed Task Queue - group-aware job processing over Redis
//!
//! A reusable library for building distributed task queues with:
//! - FIFO/LIFO/priority/round-robin-ordered plain queues
//! - Sequential, rate-limited, and concurrency-bounded task **groups**
//! - Automatic retry with fixed or exponential backoff
//! - Dead letter queue (DLQ) for exhausted or permanently failed tasks
//! - Pub/sub task lifecycle events via a [`TaskObserver`]
//! - Prometheus metrics and liveness/readiness health endpoints
//! - Graceful shutdown across every background loop
//!
//! # Architecture
//!
//! ```text
//! caller -> QueueManager::add_task
//!             ├─ ungrouped -> Queue (sorted-set scheduling)
//!             └─ grouped   -> GroupEngine (per-group strategy + concurrency)
//!                                 ↓ promotes into
//!                               Queue
//!                                 ↓ claimed by
//!                               Worker -> Handler
//!                                 ↓ on failure
//!                               DlqManager
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use task_queue::{Handler, QueueManager, RuntimeConfig, Store, Worker, WorkerConfig};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn call(&self, task: &task_queue::Task) -> Result<serde_json::Value, task_queue::QueueError> {
//!         Ok(task.handler_payload().clone())
//!     }
//! }
//!
//! let store = Store::connect(&config.store).await?;
//! let manager = std::sync::Arc::new(QueueManager::new(store.clone(), config.clone()));
//! manager.spawn_background_loops();
//! ```

mod config;
pub mod dlq;
mod error;
pub mod group;
mod health;
mod lock;
mod manager;
pub mod metrics;
mod observer;
mod queue;
mod store;
mod task;
mod worker;

pub use config::{Backoff, DlqConfig, GroupDefaults, QueueDefaults, RateLimit, RuntimeConfig, Strategy, StoreConfig};
pub use dlq::{DlqEntry, DlqManager, DlqStats};
pub use error::{ErrorCategory, QueueError, RetryStrategy};
pub use group::{FailOutcome, GroupEngine, GroupRegistry, GroupStats};
pub use health::{health_handler, health_router, metrics_handler, ready_handler, HealthState};
pub use lock::{DistributedLock, LockGuard, RateLimitOutcome, SlidingWindowRateLimiter};
pub use manager::{QueueManager, QueueMeta};
pub use observer::{EventPayload, ObserverEvent, TaskObserver};
pub use queue::Queue;
pub use store::Store;
pub use task::{composite_score, RateLimitOverride, RemoveOnComplete, Schedule, Task, TaskErrorInfo, TaskOptions, TaskState};
pub use worker::{FnHandler, Handler, HistoryEntry, Worker, WorkerConfig, WorkerHandle};

/// Result type alias for task queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
