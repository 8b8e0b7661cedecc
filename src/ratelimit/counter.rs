//! Sliding-window counter implementation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use super::backend::WindowOutcome;

/// Time window (period unit) for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.duration().as_millis() as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }

    /// Parse the lowercase name used in configuration and storage.
    pub fn parse(unit: &str) -> Option<Self> {
        match unit.to_ascii_lowercase().as_str() {
            "second" => Some(TimeWindow::Second),
            "minute" => Some(TimeWindow::Minute),
            "hour" => Some(TimeWindow::Hour),
            "day" => Some(TimeWindow::Day),
            _ => None,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-process sliding-window log.
///
/// Holds the timestamps (Unix ms) of admitted requests, oldest first. The
/// rules match the Redis script exactly: entries scored at or before
/// `now - window` are dropped, a request is rejected once the remaining
/// count reaches the limit, and the retry hint is derived from the oldest
/// surviving entry.
#[derive(Debug, Default)]
pub struct SlidingWindowCounter {
    hits: VecDeque<u64>,
}

impl SlidingWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn trim(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(&oldest) = self.hits.front() {
            if oldest > cutoff {
                break;
            }
            self.hits.pop_front();
        }
    }

    /// Admit one request if the window has room.
    pub fn try_acquire(&mut self, now_ms: u64, window_ms: u64, limit: u64) -> WindowOutcome {
        self.trim(now_ms, window_ms);

        let count = self.hits.len() as u64;
        if count >= limit {
            let until_free = self.until_oldest_expires(now_ms, window_ms);
            return WindowOutcome {
                allowed: false,
                count,
                retry_after_ms: Some(until_free),
                reset_after_ms: until_free,
            };
        }

        self.hits.push_back(now_ms);
        WindowOutcome {
            allowed: true,
            count: count + 1,
            retry_after_ms: None,
            reset_after_ms: self.until_oldest_expires(now_ms, window_ms),
        }
    }

    /// Number of requests currently inside the window.
    pub fn current_count(&mut self, now_ms: u64, window_ms: u64) -> u64 {
        self.trim(now_ms, window_ms);
        self.hits.len() as u64
    }

    /// Whether every recorded hit has left the window.
    pub fn is_idle(&self, now_ms: u64, window_ms: u64) -> bool {
        self.hits
            .back()
            .map_or(true, |&newest| newest <= now_ms.saturating_sub(window_ms))
    }

    fn until_oldest_expires(&self, now_ms: u64, window_ms: u64) -> u64 {
        let remaining = match self.hits.front() {
            Some(&oldest) => (oldest + window_ms).saturating_sub(now_ms),
            None => window_ms,
        };
        remaining.clamp(1, window_ms.max(1))
    }
}
