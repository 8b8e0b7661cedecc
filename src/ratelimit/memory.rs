//! In-process window store.
//!
//! Used when no Redis URL is configured and throughout the tests. State is
//! lost on restart and not shared between instances.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::backend::{WindowOutcome, WindowStore};
use super::counter::SlidingWindowCounter;
use crate::error::Result;

/// Idle counters are swept after this many hits.
const SWEEP_EVERY: u64 = 1024;

struct WindowEntry {
    counter: SlidingWindowCounter,
    window_ms: u64,
}

/// Window store keeping every counter in a process-local map.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, WindowEntry>>,
    flags: Mutex<HashMap<String, (String, u64)>>,
    hits: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Drop counters whose hits have all left their window.
    pub fn purge_idle(&self, now_ms: u64) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, entry| !entry.counter.is_idle(now_ms, entry.window_ms));
        before - windows.len()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        if self.hits.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_idle(now_ms);
        }

        let mut windows = self.windows.lock();
        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                counter: SlidingWindowCounter::new(),
                window_ms,
            });
        entry.window_ms = window_ms;
        Ok(entry.counter.try_acquire(now_ms, window_ms, limit))
    }

    async fn usage(&self, key: &str, window_ms: u64, now_ms: u64) -> Result<u64> {
        let mut windows = self.windows.lock();
        Ok(windows
            .get_mut(key)
            .map_or(0, |entry| entry.counter.current_count(now_ms, window_ms)))
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|key, _| !key.starts_with(prefix));
        Ok((before - windows.len()) as u64)
    }

    async fn set_flag(&self, key: &str, value: &str, ttl_ms: u64, now_ms: u64) -> Result<()> {
        self.flags
            .lock()
            .insert(key.to_string(), (value.to_string(), now_ms + ttl_ms));
        Ok(())
    }

    async fn get_flag(&self, key: &str, now_ms: u64) -> Result<Option<(String, u64)>> {
        let mut flags = self.flags.lock();
        match flags.get(key) {
            Some((value, expires_at)) if *expires_at > now_ms => {
                Ok(Some((value.clone(), expires_at - now_ms)))
            }
            Some(_) => {
                flags.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_flag(&self, key: &str) -> Result<bool> {
        Ok(self.flags.lock().remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
