//! Per-tenant per-minute request counts, aggregated in process and
//! periodically merged into the rule store.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{RateLimitMetrics, RuleStore};

const BUCKET_MS: u64 = 60_000;

/// How a request was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Blocked,
    Bypassed,
}

/// In-process aggregation of decisions.
#[derive(Default)]
pub struct MetricsRecorder {
    buckets: DashMap<(String, u64), RateLimitMetrics>,
}

fn bucket_start(bucket_ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(bucket_ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant_id: &str, decision: Decision, now_ms: u64) {
        let bucket = now_ms - now_ms % BUCKET_MS;
        let mut row = self
            .buckets
            .entry((tenant_id.to_string(), bucket))
            .or_insert_with(|| RateLimitMetrics::empty(tenant_id, bucket_start(bucket)));

        row.total_requests += 1;
        match decision {
            Decision::Allowed => row.allowed_requests += 1,
            Decision::Blocked => row.blocked_requests += 1,
            Decision::Bypassed => row.bypassed_requests += 1,
        }
    }

    /// Remove and return buckets that are closed at `now_ms`, or every
    /// bucket when `include_open` is set.
    pub fn drain(&self, now_ms: u64, include_open: bool) -> Vec<RateLimitMetrics> {
        let current = now_ms - now_ms % BUCKET_MS;
        let closed: Vec<(String, u64)> = self
            .buckets
            .iter()
            .filter(|entry| include_open || entry.key().1 < current)
            .map(|entry| entry.key().clone())
            .collect();

        closed
            .into_iter()
            .filter_map(|key| self.buckets.remove(&key).map(|(_, row)| row))
            .collect()
    }

    /// Merge drained buckets into the store. On failure the rows are put
    /// back so the next flush retries them.
    pub async fn flush(&self, store: &dyn RuleStore, now_ms: u64, include_open: bool) -> Result<usize> {
        let rows = self.drain(now_ms, include_open);
        if rows.is_empty() {
            return Ok(0);
        }

        if let Err(e) = store.merge_metrics(&rows).await {
            for row in rows {
                let bucket = row.bucket_start.timestamp_millis().max(0) as u64;
                self.buckets
                    .entry((row.tenant_id.clone(), bucket))
                    .or_insert_with(|| RateLimitMetrics::empty(&row.tenant_id, row.bucket_start))
                    .merge(&row);
            }
            return Err(e);
        }

        debug!(rows = rows.len(), "Flushed rate limit metrics");
        Ok(rows.len())
    }

    pub fn pending_buckets(&self) -> usize {
        self.buckets.len()
    }
}

/// Spawn the background task flushing closed buckets every `interval`.
///
/// The task exits between flushes once `shutdown` changes or its sender is
/// dropped, so a flush in progress is never cut short.
pub fn spawn_flusher(
    recorder: Arc<MetricsRecorder>,
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn super::clock::Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    if let Err(e) = recorder.flush(store.as_ref(), clock.now_ms(), false).await {
                        warn!(error = %e, "Failed to flush rate limit metrics");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Metrics flusher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRuleStore;

    #[test]
    fn test_record_buckets_by_minute() {
        let recorder = MetricsRecorder::new();
        recorder.record("acme", Decision::Allowed, 0);
        recorder.record("acme", Decision::Blocked, 59_999);
        recorder.record("acme", Decision::Bypassed, 60_000);
        recorder.record("globex", Decision::Allowed, 10);

        assert_eq!(recorder.pending_buckets(), 3);

        let mut closed = recorder.drain(60_500, false);
        closed.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].tenant_id, "acme");
        assert_eq!(closed[0].total_requests, 2);
        assert_eq!(closed[0].allowed_requests, 1);
        assert_eq!(closed[0].blocked_requests, 1);
        assert_eq!(recorder.pending_buckets(), 1);

        let open = recorder.drain(60_500, true);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].bypassed_requests, 1);
    }

    #[tokio::test]
    async fn test_flush_into_store() {
        let recorder = MetricsRecorder::new();
        let store = MemoryRuleStore::new();
        recorder.record("acme", Decision::Allowed, 1_000);
        recorder.record("acme", Decision::Allowed, 2_000);

        assert_eq!(recorder.flush(&store, 30_000, false).await.unwrap(), 0);
        assert_eq!(recorder.flush(&store, 30_000, true).await.unwrap(), 1);

        let rows = store.list_metrics(Some("acme"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].allowed_requests, 2);
        assert_eq!(rows[0].bucket_start.timestamp(), 0);
    }

    #[tokio::test]
    async fn test_flusher_stops_on_shutdown() {
        let recorder = Arc::new(MetricsRecorder::new());
        let store = Arc::new(MemoryRuleStore::new());
        let clock = crate::ratelimit::ManualClock::new(120_000);
        recorder.record("acme", Decision::Allowed, 1_000);
        recorder.record("acme", Decision::Blocked, 121_000);

        let (tx, rx) = watch::channel(false);
        let handle = spawn_flusher(
            recorder.clone(),
            store.clone(),
            Arc::new(clock),
            Duration::from_secs(60),
            rx,
        );
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("flusher did not stop")
            .unwrap();

        // The first tick flushed the closed bucket; the open one is left for
        // the final flush.
        let rows = store.list_metrics(Some("acme"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].allowed_requests, 1);
        assert_eq!(recorder.pending_buckets(), 1);

        assert_eq!(recorder.flush(store.as_ref(), 125_000, true).await.unwrap(), 1);
        assert_eq!(store.list_metrics(Some("acme"), 10).await.unwrap().len(), 2);
    }
}
