//! Window store trait for abstracting in-memory and Redis implementations.

use async_trait::async_trait;

use crate::error::Result;

/// Result of one atomic check-and-increment against a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was admitted (and recorded)
    pub allowed: bool,
    /// Requests in the window after this check
    pub count: u64,
    /// Milliseconds until a slot frees up; only set on rejection
    pub retry_after_ms: Option<u64>,
    /// Milliseconds until the oldest recorded request leaves the window
    pub reset_after_ms: u64,
}

/// Storage behind the sliding-window counters and the bypass flags.
///
/// Implementations must make `hit` atomic per key: concurrent callers may
/// never admit more than `limit` requests into one window. All timestamps
/// are Unix milliseconds supplied by the caller.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Trim, count, and record one request if the window has room.
    async fn hit(&self, key: &str, limit: u64, window_ms: u64, now_ms: u64)
        -> Result<WindowOutcome>;

    /// Number of requests currently in the window, without recording one.
    async fn usage(&self, key: &str, window_ms: u64, now_ms: u64) -> Result<u64>;

    /// Delete every counter whose key starts with `prefix`. Returns the
    /// number of keys removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64>;

    /// Set a flag that expires after `ttl_ms`.
    async fn set_flag(&self, key: &str, value: &str, ttl_ms: u64, now_ms: u64) -> Result<()>;

    /// Read a flag and its remaining lifetime, if it has not expired.
    async fn get_flag(&self, key: &str, now_ms: u64) -> Result<Option<(String, u64)>>;

    /// Remove a flag. Returns whether it existed.
    async fn delete_flag(&self, key: &str) -> Result<bool>;

    /// Round-trip to the store, used by health checks.
    async fn ping(&self) -> Result<()>;
}
