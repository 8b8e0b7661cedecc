//! Emergency bypass: a time-bounded flag that disables enforcement for
//! one tenant.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::backend::WindowStore;
use super::clock::Clock;
use super::key::bypass_key;
use crate::error::{LimiterError, Result};

/// Longest bypass an administrator may activate.
pub const MAX_BYPASS_DURATION: Duration = Duration::from_secs(60 * 60);

/// Shortest bypass that can be activated.
pub const MIN_BYPASS_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BypassRecord {
    reason: String,
    activated_by: Option<String>,
    activated_at_ms: u64,
}

/// Current state of an active bypass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassStatus {
    pub tenant_id: String,
    pub reason: String,
    pub activated_by: Option<String>,
    pub activated_at_ms: u64,
    pub expires_in_ms: u64,
}

/// Activates, inspects and removes tenant bypass flags.
pub struct BypassManager {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl BypassManager {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>, key_prefix: &str) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Disable enforcement for a tenant for at most one hour.
    pub async fn activate(
        &self,
        tenant_id: &str,
        duration: Duration,
        reason: &str,
        activated_by: Option<&str>,
    ) -> Result<BypassStatus> {
        if duration < MIN_BYPASS_DURATION || duration > MAX_BYPASS_DURATION {
            return Err(LimiterError::Validation(format!(
                "bypass duration must be between 1 second and {} minutes",
                MAX_BYPASS_DURATION.as_secs() / 60
            )));
        }
        if reason.trim().is_empty() {
            return Err(LimiterError::Validation("bypass reason is required".into()));
        }

        let now = self.clock.now_ms();
        let record = BypassRecord {
            reason: reason.to_string(),
            activated_by: activated_by.map(str::to_string),
            activated_at_ms: now,
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| LimiterError::Store(format!("bypass encode: {}", e)))?;
        let ttl_ms = duration.as_millis() as u64;

        self.store
            .set_flag(&bypass_key(&self.key_prefix, tenant_id), &value, ttl_ms, now)
            .await?;

        error!(
            severity = "critical",
            tenant_id,
            reason,
            activated_by = activated_by.unwrap_or("unknown"),
            duration_secs = duration.as_secs(),
            "Emergency rate limit bypass activated"
        );

        Ok(BypassStatus {
            tenant_id: tenant_id.to_string(),
            reason: record.reason,
            activated_by: record.activated_by,
            activated_at_ms: now,
            expires_in_ms: ttl_ms,
        })
    }

    /// Remove a tenant's bypass. Returns whether one was active.
    pub async fn deactivate(&self, tenant_id: &str, removed_by: Option<&str>) -> Result<bool> {
        let existed = self
            .store
            .delete_flag(&bypass_key(&self.key_prefix, tenant_id))
            .await?;

        if existed {
            error!(
                severity = "critical",
                tenant_id,
                removed_by = removed_by.unwrap_or("unknown"),
                "Emergency rate limit bypass removed"
            );
        }
        Ok(existed)
    }

    /// The tenant's active bypass, if any.
    pub async fn status(&self, tenant_id: &str) -> Result<Option<BypassStatus>> {
        let now = self.clock.now_ms();
        let flag = self
            .store
            .get_flag(&bypass_key(&self.key_prefix, tenant_id), now)
            .await?;

        Ok(flag.map(|(value, expires_in_ms)| {
            let record = serde_json::from_str::<BypassRecord>(&value).unwrap_or_else(|e| {
                warn!(tenant_id, error = %e, "Unreadable bypass record, treating as active");
                BypassRecord {
                    reason: value.clone(),
                    activated_by: None,
                    activated_at_ms: 0,
                }
            });
            BypassStatus {
                tenant_id: tenant_id.to_string(),
                reason: record.reason,
                activated_by: record.activated_by,
                activated_at_ms: record.activated_at_ms,
                expires_in_ms,
            }
        }))
    }

    pub async fn is_active(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.status(tenant_id).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::MemoryWindowStore;

    fn manager(clock: &ManualClock) -> BypassManager {
        BypassManager::new(
            Arc::new(MemoryWindowStore::new()),
            Arc::new(clock.clone()),
            "rate_limit",
        )
    }

    #[tokio::test]
    async fn test_activate_and_expire() {
        let clock = ManualClock::new(1_000);
        let bypass = manager(&clock);

        let status = bypass
            .activate("acme", Duration::from_secs(600), "incident 42", Some("ops"))
            .await
            .unwrap();
        assert_eq!(status.expires_in_ms, 600_000);
        assert!(bypass.is_active("acme").await.unwrap());
        assert!(!bypass.is_active("globex").await.unwrap());

        clock.advance(Duration::from_secs(300));
        let status = bypass.status("acme").await.unwrap().unwrap();
        assert_eq!(status.reason, "incident 42");
        assert_eq!(status.activated_by.as_deref(), Some("ops"));
        assert_eq!(status.expires_in_ms, 300_000);

        clock.advance(Duration::from_secs(300));
        assert!(!bypass.is_active("acme").await.unwrap());
    }

    #[tokio::test]
    async fn test_duration_bounds() {
        let clock = ManualClock::new(0);
        let bypass = manager(&clock);

        for duration in [
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::from_millis(999),
            Duration::from_secs(3601),
        ] {
            let err = bypass
                .activate("acme", duration, "reason", None)
                .await
                .unwrap_err();
            assert!(matches!(err, LimiterError::Validation(_)));
        }
        for duration in [MIN_BYPASS_DURATION, MAX_BYPASS_DURATION] {
            assert!(bypass
                .activate("acme", duration, "reason", None)
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_requires_reason() {
        let clock = ManualClock::new(0);
        let bypass = manager(&clock);
        let err = bypass
            .activate("acme", Duration::from_secs(60), "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_deactivate() {
        let clock = ManualClock::new(0);
        let bypass = manager(&clock);

        assert!(!bypass.deactivate("acme", None).await.unwrap());
        bypass
            .activate("acme", Duration::from_secs(60), "load test", None)
            .await
            .unwrap();
        assert!(bypass.deactivate("acme", Some("ops")).await.unwrap());
        assert!(!bypass.is_active("acme").await.unwrap());
    }
}
