//! Distributed lock and sliding-window rate limiter for the Group Engine
//! (§4.F).
//!
//! The lock's acquire/release/extend shape is an atomically-guarded holder
//! with a TTL; release and extension are server-side Lua scripts, not
//! hand-rolled GET-then-DEL, which would race against a concurrent holder.

use once_cell::sync::Lazy;
use redis::Script;
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::Store;

/// Only deletes the lock key if its value still matches `holder` — otherwise
/// a no-op (§8 "Lock safety").
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

/// Only refreshes the lock's TTL if its value still matches `holder`.
static EXTEND_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("PEXPIRE", KEYS[1], ARGV[2])
        else
            return 0
        end
        "#,
    )
});

/// A lock held on `group:<g>:lock` while the caller holds this guard.
/// Dropping the guard does *not* release the lock — call [`DistributedLock::release`]
/// explicitly, since release is a suspending operation.
pub struct LockGuard {
    pub key: String,
    pub holder: String,
}

pub struct DistributedLock {
    store: Store,
}

impl DistributedLock {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// `SET key holder PX ttl_ms NX` (§4.F). Returns `None` if someone else
    /// already holds the lock.
    pub async fn acquire(&self, key: &str, ttl_ms: u64) -> Result<Option<LockGuard>, QueueError> {
        let holder = Uuid::new_v4().to_string();
        let acquired = self.store.string_set(key, &holder, Some(ttl_ms), true).await?;
        if acquired {
            Ok(Some(LockGuard {
                key: key.to_string(),
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry acquisition a bounded number of times with a short fixed
    /// backoff, surfacing `lock_unavailable` if every attempt fails.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl_ms: u64,
        attempts: u32,
        retry_delay_ms: u64,
    ) -> Result<LockGuard, QueueError> {
        for attempt in 0..attempts {
            if let Some(guard) = self.acquire(key, ttl_ms).await? {
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(std::time::Duration::from_millis(retry_delay_ms)).await;
            }
        }
        Err(QueueError::LockUnavailable(format!(
            "could not acquire lock '{key}' after {attempts} attempts"
        )))
    }

    /// Compare-and-delete release. A no-op if `guard.holder` no longer
    /// matches the stored value (lock expired and was taken by someone else).
    pub async fn release(&self, guard: &LockGuard) -> Result<(), QueueError> {
        let _: i64 = self
            .store
            .eval_script(&RELEASE_SCRIPT, &[guard.key.clone()], &[guard.holder.clone()])
            .await?;
        Ok(())
    }

    /// Compare-and-expire extension, used to renew a lock held across a
    /// longer critical section than its TTL would otherwise survive.
    pub async fn extend(&self, guard: &LockGuard, ttl_ms: u64) -> Result<bool, QueueError> {
        let extended: i64 = self
            .store
            .eval_script(
                &EXTEND_SCRIPT,
                &[guard.key.clone()],
                &[guard.holder.clone(), ttl_ms.to_string()],
            )
            .await?;
        Ok(extended == 1)
    }
}

/// Outcome of a rate-limit admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed,
    Limited,
}

/// Sliding-window rate limiter backed by a sorted set of admission
/// timestamps (§4.F "Rate limiting"). Unlike an in-process token bucket,
/// this one must be visible across processes, so it lives entirely in the
/// store.
pub struct SlidingWindowRateLimiter {
    store: Store,
}

impl SlidingWindowRateLimiter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Prune entries older than `now - duration_ms`; if the remaining count
    /// is below `max`, record this admission and allow it; otherwise reject.
    pub async fn check_and_record(
        &self,
        key: &str,
        max: u32,
        duration_ms: u64,
        now_ms: i64,
    ) -> Result<RateLimitOutcome, QueueError> {
        let cutoff = (now_ms as f64) - (duration_ms as f64);
        self.store.zremrangebyscore(key, f64::MIN, cutoff).await?;

        let count = self.store.zcard(key).await?;
        if count >= max as u64 {
            return Ok(RateLimitOutcome::Limited);
        }

        // Member must be unique even for admissions within the same
        // millisecond; a uuid suffix keeps the zset a true multiset.
        let member = format!("{now_ms}:{}", Uuid::new_v4());
        self.store.zadd(key, &member, now_ms as f64).await?;
        Ok(RateLimitOutcome::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guard_carries_holder() {
        let guard = LockGuard {
            key: "group:g1:lock".to_string(),
            holder: "abc".to_string(),
        };
        assert_eq!(guard.key, "group:g1:lock");
        assert_eq!(guard.holder, "abc");
    }

    #[test]
    fn test_rate_limit_outcome_equality() {
        assert_eq!(RateLimitOutcome::Allowed, RateLimitOutcome::Allowed);
        assert_ne!(RateLimitOutcome::Allowed, RateLimitOutcome::Limited);
    }
}
