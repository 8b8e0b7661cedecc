//! Persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{RateLimitRule, RuleScope, SubscriptionPlan, TimeWindow};

/// What the resolver needs to know about a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    #[serde(default)]
    pub plan: SubscriptionPlan,
    #[serde(default)]
    pub sic_code: Option<String>,
}

impl TenantProfile {
    /// Profile assumed for tenants the store does not know.
    pub fn unknown(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            plan: SubscriptionPlan::Free,
            sic_code: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(LimiterError::Validation("tenant_id must not be empty".into()));
        }
        if let Some(sic) = &self.sic_code {
            if sic.is_empty() || sic.len() > 4 || !sic.bytes().all(|b| b.is_ascii_digit()) {
                return Err(LimiterError::Validation(format!(
                    "sic_code must be one to four digits: {:?}",
                    sic
                )));
            }
        }
        Ok(())
    }
}

/// Per-tenant rate limit configuration.
///
/// At most one active row exists per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRateLimit {
    pub id: Uuid,
    pub tenant_id: String,
    pub requests_per_period: u64,
    pub period: TimeWindow,
    pub burst_allowance: Option<u64>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRateLimit {
    pub fn new(tenant_id: &str, input: TenantRateLimitInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            requests_per_period: input.requests_per_period,
            period: input.period,
            burst_allowance: input.burst_allowance,
            notes: input.notes,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, input: TenantRateLimitInput, now: DateTime<Utc>) {
        self.requests_per_period = input.requests_per_period;
        self.period = input.period;
        self.burst_allowance = input.burst_allowance;
        self.notes = input.notes;
        self.updated_at = now;
    }

    /// The organisation-level rule this configuration stands for.
    pub fn as_rule(&self) -> RateLimitRule {
        let mut rule = RateLimitRule::new(
            RuleScope::Org,
            Some(&self.tenant_id),
            self.requests_per_period,
            self.period,
        );
        rule.id = self.id;
        rule.burst_allowance = self.burst_allowance;
        rule.name = Some(format!("tenant:{}", self.tenant_id));
        rule
    }
}

/// Admin input for creating or replacing a tenant configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRateLimitInput {
    pub requests_per_period: u64,
    #[serde(default = "default_period")]
    pub period: TimeWindow,
    #[serde(default)]
    pub burst_allowance: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_period() -> TimeWindow {
    TimeWindow::Minute
}

impl TenantRateLimitInput {
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_period == 0 {
            return Err(LimiterError::Validation(
                "requests_per_period must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Audit record of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub rule_scope: RuleScope,
    pub limit: u64,
    pub current_usage: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Request counts of one tenant over one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitMetrics {
    pub tenant_id: String,
    pub bucket_start: DateTime<Utc>,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub bypassed_requests: u64,
}

impl RateLimitMetrics {
    pub fn empty(tenant_id: &str, bucket_start: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            bucket_start,
            total_requests: 0,
            allowed_requests: 0,
            blocked_requests: 0,
            bypassed_requests: 0,
        }
    }

    pub fn merge(&mut self, other: &RateLimitMetrics) {
        self.total_requests += other.total_requests;
        self.allowed_requests += other.allowed_requests;
        self.blocked_requests += other.blocked_requests;
        self.bypassed_requests += other.bypassed_requests;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(requests: u64) -> TenantRateLimitInput {
        TenantRateLimitInput {
            requests_per_period: requests,
            period: TimeWindow::Minute,
            burst_allowance: Some(5),
            notes: None,
        }
    }

    #[test]
    fn test_tenant_limit_as_rule() {
        let limit = TenantRateLimit::new("acme", input(100), Utc::now());
        let rule = limit.as_rule();

        assert_eq!(rule.scope, RuleScope::Org);
        assert_eq!(rule.scope_value.as_deref(), Some("acme"));
        assert_eq!(rule.effective_limit(), 105);
        assert_eq!(rule.id, limit.id);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_input_defaults_and_validation() {
        let parsed: TenantRateLimitInput =
            serde_json::from_str(r#"{"requests_per_period": 10}"#).unwrap();
        assert_eq!(parsed.period, TimeWindow::Minute);
        assert!(parsed.validate().is_ok());
        assert!(input(0).validate().is_err());
    }

    #[test]
    fn test_metrics_merge() {
        let now = Utc::now();
        let mut a = RateLimitMetrics::empty("t", now);
        a.total_requests = 3;
        a.allowed_requests = 2;
        a.blocked_requests = 1;
        let mut b = RateLimitMetrics::empty("t", now);
        b.total_requests = 1;
        b.bypassed_requests = 1;

        a.merge(&b);
        assert_eq!(a.total_requests, 4);
        assert_eq!(a.bypassed_requests, 1);
    }
}
