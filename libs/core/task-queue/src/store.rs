//! Store Abstraction (§4.A): typed operations over a Redis-compatible
//! key/value + pub/sub server.
//!
//! Every operation suspends (network I/O) and propagates store errors to
//! the caller as [`QueueError::TransientStore`] — callers are expected to
//! be tolerant of transient disconnects; `ConnectionManager` already
//! reconnects with backoff underneath us, so this layer does not add its
//! own retry loop on top.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use tracing::debug;

use crate::error::QueueError;

/// A handle to the backing store. Cheap to clone — `ConnectionManager`
/// is itself a lightweight, internally-reconnecting handle, and `Client`
/// is used only to open additional connections for pub/sub.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    client: Client,
    key_prefix: Option<String>,
}

impl Store {
    pub async fn connect(uri: &str, key_prefix: Option<String>) -> Result<Self, QueueError> {
        let client = Client::open(uri).map_err(QueueError::TransientStore)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(QueueError::TransientStore)?;
        Ok(Self {
            conn,
            client,
            key_prefix,
        })
    }

    /// Build from an already-established connection manager, e.g. for tests
    /// against an ephemeral container.
    pub fn from_connection_manager(conn: ConnectionManager, client: Client) -> Self {
        Self {
            conn,
            client,
            key_prefix: None,
        }
    }

    fn k(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Open a dedicated connection for pub/sub, distinct from the
    /// publisher/command connection (§4.B, §9 "observer callbacks on a
    /// shared store connection").
    pub async fn subscriber_connection(&self) -> Result<redis::aio::PubSub, QueueError> {
        self.client
            .get_async_pubsub()
            .await
            .map_err(QueueError::TransientStore)
    }

    // -- strings --------------------------------------------------------

    pub async fn string_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(self.k(key)).await?;
        Ok(value)
    }

    /// Set a string value, optionally with a TTL and/or set-if-absent (NX).
    /// Returns `true` if the value was written.
    pub async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl_ms: Option<u64>,
        nx: bool,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.k(key)).arg(value);
        if let Some(ttl) = ttl_ms {
            cmd.arg("PX").arg(ttl);
        }
        if nx {
            cmd.arg("NX");
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    pub async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("PEXPIRE")
            .arg(self.k(key))
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // -- hashes -----------------------------------------------------------

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.hset(self.k(key), field, value).await?;
        Ok(())
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(self.k(key), field).await?;
        Ok(value)
    }

    pub async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, QueueError> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(self.k(key), field, delta).await?;
        Ok(value)
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        let mut conn = self.conn();
        let value: HashMap<String, String> = conn.hgetall(self.k(key)).await?;
        Ok(value)
    }

    pub async fn hash_del(&self, key: &str, field: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.hdel(self.k(key), field).await?;
        Ok(())
    }

    // -- lists --------------------------------------------------------------

    pub async fn list_rpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.rpush(self.k(key), value).await?;
        Ok(())
    }

    pub async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();
        let value: Vec<String> = conn.lrange(self.k(key), start, stop).await?;
        Ok(value)
    }

    pub async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.ltrim(self.k(key), start, stop).await?;
        Ok(())
    }

    pub async fn list_len(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let value: u64 = conn.llen(self.k(key)).await?;
        Ok(value)
    }

    // -- sets -----------------------------------------------------------

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.sadd(self.k(key), member).await?;
        Ok(())
    }

    pub async fn set_rem(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.srem(self.k(key), member).await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();
        let value: Vec<String> = conn.smembers(self.k(key)).await?;
        Ok(value)
    }

    pub async fn set_card(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let value: u64 = conn.scard(self.k(key)).await?;
        Ok(value)
    }

    pub async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let value: bool = conn.sismember(self.k(key), member).await?;
        Ok(value)
    }

    // -- sorted sets ------------------------------------------------------

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.zadd(self.k(key), member, score).await?;
        Ok(())
    }

    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>, QueueError> {
        let mut conn = self.conn();
        let value: Vec<(String, f64)> = conn
            .zrange_withscores(self.k(key), start, stop)
            .await?;
        Ok(value)
    }

    pub async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>, QueueError> {
        let mut conn = self.conn();
        let value: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.k(key), start, stop)
            .await?;
        Ok(value)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.zrem(self.k(key), member).await?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let value: u64 = conn.zcard(self.k(key)).await?;
        Ok(value)
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, QueueError> {
        let mut conn = self.conn();
        let value: Option<f64> = conn.zscore(self.k(key), member).await?;
        Ok(value)
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.zrembyscore(self.k(key), min, max).await?;
        Ok(())
    }

    /// Count members scored within `[min, max]`, without fetching them —
    /// used for windowed counts (e.g. DLQ failures in the last 24h) where the
    /// member list itself is irrelevant.
    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let value: u64 = conn.zcount(self.k(key), min, max).await?;
        Ok(value)
    }

    // -- keys / pub-sub -----------------------------------------------------

    pub async fn del(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.del(self.k(key)).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();
        let value: bool = conn.exists(self.k(key)).await?;
        Ok(value)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        debug!(channel, "published event");
        Ok(())
    }

    /// Liveness check for the ambient health surface (§4.I): `PING` the
    /// command connection and confirm the expected reply.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(QueueError::TransientStore(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected PING reply",
            ))));
        }
        Ok(())
    }

    // -- server-side scripts ---------------------------------------------

    /// Run a server-side Lua script — compare-and-delete/compare-and-expire
    /// for locks (§4.F), and the atomic claim/select scripts `Queue` and
    /// `GroupEngine` use so a read-then-write pair across cooperating worker
    /// processes can never split (§8 "exactly-once selection"). A `redis`
    /// connection multiplexed through `ConnectionManager` is shared by every
    /// `Store` clone, so `WATCH`/`MULTI`/`EXEC` is unusable here — one
    /// caller's `EXEC` would silently clear another's in-flight `WATCH` on
    /// the same physical connection. `EVAL` has no such cross-talk: the
    /// whole script runs as one atomic server-side step regardless of how
    /// many logical callers share the connection.
    pub async fn eval_script<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T, QueueError> {
        let mut conn = self.conn();
        let mut invocation = script.key(keys.iter().map(|k| self.k(k)).collect::<Vec<_>>());
        for arg in args {
            invocation.arg(arg);
        }
        let value: T = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }
}
