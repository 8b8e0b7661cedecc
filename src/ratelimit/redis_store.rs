//! Redis-backed window store.
//!
//! Each counter is a sorted set whose members are admitted requests scored
//! by their Unix-millisecond timestamp. The check-and-increment runs as a
//! single Lua script so concurrent limiter instances cannot race between
//! the count and the insert.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use super::backend::{WindowOutcome, WindowStore};
use crate::error::Result;

/// KEYS[1] = counter key
/// ARGV    = now_ms, window_ms, limit, member
/// Returns {allowed, count, retry_after_ms, reset_after_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

local function until_oldest_expires()
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  local remaining = window
  if oldest[2] then
    remaining = tonumber(oldest[2]) + window - now
  end
  if remaining < 1 then remaining = 1 end
  if remaining > window then remaining = window end
  return remaining
end

if count >= limit then
  local retry = until_oldest_expires()
  return {0, count, retry, retry}
end

redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)
return {1, count + 1, 0, until_oldest_expires()}
"#;

/// Window store backed by a shared Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    manager: ConnectionManager,
    script: Script,
}

impl fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

/// Escape glob metacharacters for use in `SCAN MATCH`.
fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let mut conn = self.manager.clone();
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let (allowed, count, retry_after_ms, reset_after_ms): (i64, u64, u64, u64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count,
            retry_after_ms: (allowed == 0).then_some(retry_after_ms),
            reset_after_ms,
        })
    }

    async fn usage(&self, key: &str, window_ms: u64, now_ms: u64) -> Result<u64> {
        let mut conn = self.manager.clone();
        let cutoff = now_ms.saturating_sub(window_ms);
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", cutoff))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "Cleared rate limit counters");
        Ok(removed)
    }

    async fn set_flag(&self, key: &str, value: &str, ttl_ms: u64, _now_ms: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_flag(&self, key: &str, _now_ms: u64) -> Result<Option<(String, u64)>> {
        let mut conn = self.manager.clone();
        let (value, ttl_ms): (Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        // PTTL is -2 for a missing key and -1 for a key without expiry;
        // bypass flags are always written with one.
        Ok(match value {
            Some(value) if ttl_ms > 0 => Some((value, ttl_ms as u64)),
            _ => None,
        })
    }

    async fn delete_flag(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
