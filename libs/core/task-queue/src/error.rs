//! Error types for the task queue.
//!
//! This module provides:
//! - `QueueError` - the error kinds a caller of this crate can observe
//! - `ErrorCategory` - whether an error is recoverable by retry
//! - `RetryStrategy` - how a recoverable error should be retried

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the queue manager, group engine, worker, and store.
///
/// Variants correspond one-to-one with the error kinds a deployment's
/// observability tooling is expected to discriminate on.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Missing or invalid process-level configuration (e.g. no store host).
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A queue, task, or group referenced by name/id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency invalidation during group selection.
    #[error("conflict during optimistic update: {0}")]
    Conflict(String),

    /// Group admission blocked by its sliding-window rate limit.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// A distributed lock could not be acquired within the allotted attempts.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// A worker has no handler registered under the job's `name`.
    #[error("no handler registered for task name '{0}'")]
    HandlerMissing(String),

    /// A task attempt exceeded its configured timeout.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// Connectivity, authentication, or protocol failure talking to the store.
    #[error("store error: {0}")]
    TransientStore(#[from] redis::RedisError),

    /// A handler returned an application-level failure.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// Payload failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Classify this error for retry/propagation purposes, per the
    /// core's error handling policy: local recovery applies to `conflict`,
    /// `timeout`, and handler failures within the retry budget; everything
    /// else is surfaced to the caller unchanged.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Conflict(_) => ErrorCategory::Transient,
            Self::Timeout(_) => ErrorCategory::Transient,
            Self::HandlerFailed(_) => ErrorCategory::Transient,
            Self::LockUnavailable(_) => ErrorCategory::Transient,
            Self::RateLimited(_) => ErrorCategory::RateLimited,
            Self::TransientStore(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("noauth") || msg.contains("wrongpass") || msg.contains("auth") {
                    ErrorCategory::Permanent
                } else {
                    ErrorCategory::Transient
                }
            }
            Self::Config(_)
            | Self::NotFound(_)
            | Self::HandlerMissing(_)
            | Self::Serialization(_) => ErrorCategory::Permanent,
        }
    }

    /// True when the store error looks like an authentication failure,
    /// in which case the distinguishing hint must be logged rather than
    /// swallowed (§7 `transient_store`).
    pub fn auth_hint(&self) -> Option<&'static str> {
        match self {
            Self::TransientStore(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("noauth") {
                    Some("store requires authentication (NOAUTH)")
                } else if msg.contains("wrongpass") {
                    Some("store rejected the configured credentials (WRONGPASS)")
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Whether an error category is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Likely to resolve on retry (lock contention, optimistic conflict,
    /// transient connectivity, a slow handler that timed out).
    Transient,
    /// Will not resolve on retry (bad config, missing handler, malformed data).
    Permanent,
    /// Caller is being throttled; back off longer than a plain transient retry.
    RateLimited,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Retry pacing for a failed task attempt, selected from `TaskOptions.backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Constant delay between attempts.
    Fixed { delay_ms: u64, max_retries: u32 },
    /// `delay_ms · 2^(attempt-1)`, capped, with jitter.
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
}

impl RetryStrategy {
    /// Delay before the next attempt, or `None` if the retry budget is exhausted.
    ///
    /// `attempt` is zero-based (0 = first retry, after the initial attempt failed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Fixed {
                delay_ms,
                max_retries,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                Some(Duration::from_millis(*delay_ms))
            }
            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
                max_retries,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let exp_delay = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
                let capped = exp_delay.min(*max_delay_ms);
                Some(Duration::from_millis(apply_jitter(capped)))
            }
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Fixed { max_retries, .. } => *max_retries,
            Self::Exponential { max_retries, .. } => *max_retries,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Apply jitter to a delay (±25% randomness) to avoid a thundering herd of
/// retries landing on the same tick.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let hash = hasher.finish();

    let jitter_range = delay_ms / 4;
    if jitter_range == 0 {
        return delay_ms;
    }

    let random_offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;
    if random_offset < 0 {
        delay_ms.saturating_sub((-random_offset) as u64)
    } else {
        delay_ms.saturating_add(random_offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::HandlerMissing("echo".to_string());
        assert_eq!(
            err.to_string(),
            "no handler registered for task name 'echo'"
        );
    }

    #[test]
    fn test_category_conflict_is_transient() {
        let err = QueueError::Conflict("watch invalidated".to_string());
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_category_handler_missing_is_permanent() {
        let err = QueueError::HandlerMissing("echo".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.category().should_retry());
    }

    #[test]
    fn test_category_rate_limited() {
        let err = QueueError::RateLimited("group g1 over quota".to_string());
        assert_eq!(err.category(), ErrorCategory::RateLimited);
    }

    #[test]
    fn test_fixed_strategy_exhausts() {
        let strategy = RetryStrategy::Fixed {
            delay_ms: 100,
            max_retries: 2,
        };
        assert!(strategy.should_retry(0));
        assert!(strategy.should_retry(1));
        assert!(!strategy.should_retry(2));
        assert_eq!(strategy.delay_for_attempt(0), Some(Duration::from_millis(100)));
        assert_eq!(strategy.delay_for_attempt(2), None);
    }

    #[test]
    fn test_exponential_strategy_doubles_and_caps() {
        let strategy = RetryStrategy::Exponential {
            base_delay_ms: 100,
            max_delay_ms: 300,
            max_retries: 5,
        };
        // attempt 0 -> ~100ms, attempt 1 -> ~200ms, attempt 2+ capped at ~300ms
        let d0 = strategy.delay_for_attempt(0).unwrap().as_millis();
        let d2 = strategy.delay_for_attempt(2).unwrap().as_millis();
        assert!(d0 <= 125);
        assert!(d2 <= 375); // capped delay + jitter headroom
    }

    #[test]
    fn test_max_retries() {
        let strategy = RetryStrategy::Exponential {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_retries: 3,
        };
        assert_eq!(strategy.max_retries(), 3);
    }
}
