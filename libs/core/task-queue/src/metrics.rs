//! Prometheus-compatible metrics for queues, groups, and the DLQ (§3, §6).
//!
//! ## Available metrics
//!
//! - `task_queue_tasks_processed_total` - counter of attempts by status
//! - `task_queue_total_processing_time_seconds` - histogram of attempt duration
//! - `task_queue_queue_waiting_size` - gauge of a queue's waiting-set size
//! - `task_queue_group_processing_size` - gauge of a group's concurrently-active count
//! - `task_queue_dlq_total_failed` - gauge of a queue's lifetime DLQ failure count
//! - `task_queue_retries_total` - counter of retry attempts
//! - `task_queue_errors_total` - counter of errors by category
//! - `task_queue_in_flight_tasks` - gauge of concurrently-attempted tasks

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const TASKS_PROCESSED: &str = "task_queue_tasks_processed_total";
    pub const PROCESSING_TIME: &str = "task_queue_total_processing_time_seconds";
    pub const QUEUE_WAITING_SIZE: &str = "task_queue_queue_waiting_size";
    pub const GROUP_PROCESSING_SIZE: &str = "task_queue_group_processing_size";
    pub const DLQ_TOTAL_FAILED: &str = "task_queue_dlq_total_failed";
    pub const RETRIES: &str = "task_queue_retries_total";
    pub const ERRORS: &str = "task_queue_errors_total";
    pub const IN_FLIGHT: &str = "task_queue_in_flight_tasks";
}

/// Outcome of one task attempt, for `TASKS_PROCESSED` labeling.
#[derive(Debug, Clone, Copy)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Dlq,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::Skipped => "skipped",
        }
    }
}

/// Mirrors [`crate::error::ErrorCategory`] for metric labeling.
#[derive(Debug, Clone, Copy)]
pub enum ErrorType {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Install the process-wide Prometheus recorder. Idempotent — safe to call
/// more than once; later calls just return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_task_processed(queue: &str, status: TaskStatus) {
    counter!(
        names::TASKS_PROCESSED,
        "queue" => queue.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

pub fn record_task_duration(queue: &str, operation: &str, duration: Duration) {
    histogram!(
        names::PROCESSING_TIME,
        "queue" => queue.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_queue_waiting_size(queue: &str, size: f64) {
    gauge!(names::QUEUE_WAITING_SIZE, "queue" => queue.to_string()).set(size);
}

pub fn set_group_processing_size(group: &str, size: f64) {
    gauge!(names::GROUP_PROCESSING_SIZE, "group" => group.to_string()).set(size);
}

pub fn set_dlq_total_failed(queue: &str, total: f64) {
    gauge!(names::DLQ_TOTAL_FAILED, "queue" => queue.to_string()).set(total);
}

pub fn record_retry(queue: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

pub fn record_error(queue: &str, error_type: ErrorType) {
    counter!(
        names::ERRORS,
        "queue" => queue.to_string(),
        "error_type" => error_type.as_str().to_string()
    )
    .increment(1);
}

pub fn set_in_flight_tasks(queue: &str, count: f64) {
    gauge!(names::IN_FLIGHT, "queue" => queue.to_string()).set(count);
}

/// Times an operation and records it to `PROCESSING_TIME` on drop, unless
/// [`MetricsTimer::stop`] already recorded it.
pub struct MetricsTimer {
    queue: String,
    operation: String,
    start: std::time::Instant,
    stopped: bool,
}

impl MetricsTimer {
    pub fn new(queue: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            operation: operation.into(),
            start: std::time::Instant::now(),
            stopped: false,
        }
    }

    pub fn stop(mut self) {
        record_task_duration(&self.queue, &self.operation, self.start.elapsed());
        self.stopped = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if !self.stopped {
            record_task_duration(&self.queue, &self.operation, self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_as_str() {
        assert_eq!(TaskStatus::Succeeded.as_str(), "succeeded");
        assert_eq!(TaskStatus::Dlq.as_str(), "dlq");
    }

    #[test]
    fn test_error_type_as_str() {
        assert_eq!(ErrorType::Transient.as_str(), "transient");
        assert_eq!(ErrorType::RateLimited.as_str(), "rate_limited");
    }

    #[test]
    fn test_metrics_timer_elapsed() {
        let timer = MetricsTimer::new("default", "attempt");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed().as_millis() >= 5);
    }
}
