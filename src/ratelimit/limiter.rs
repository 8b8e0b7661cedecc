//! Core rate limiter: bypass check, rule resolution, sliding-window
//! enforcement and violation auditing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::backend::WindowStore;
use super::bypass::BypassManager;
use super::clock::Clock;
use super::key::{endpoint_hash, tenant_prefixes, LimitKey};
use super::metrics::{Decision, MetricsRecorder};
use super::resolver::RuleResolver;
use super::rules::{RateLimitRule, RuleScope};
use crate::config::{FailurePolicy, RateLimitingConfig};
use crate::error::Result;
use crate::store::{RateLimitViolation, RuleStore};

/// Identity of a request being checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl CheckRequest {
    pub fn new(tenant_id: &str, user_id: Option<&str>, endpoint: &str, method: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.map(str::to_string),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }
}

/// Outcome of a rate limit check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests counted in the current window, including this one if admitted
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time (seconds) at which the oldest counted request leaves the window
    pub reset_at: u64,
    /// Milliseconds to wait before retrying; only set on rejection
    pub retry_after_ms: Option<u64>,
    /// Scope of the rule that was enforced
    pub scope: Option<RuleScope>,
    /// Set when an emergency bypass short-circuited the check
    pub bypassed: bool,
    /// Set when the store was unreachable and the request was let through
    pub degraded: bool,
}

impl RateLimitResult {
    fn unenforced(now_ms: u64, bypassed: bool) -> Self {
        Self {
            allowed: true,
            current_usage: 0,
            limit: 0,
            remaining: 0,
            reset_at: now_ms / 1000,
            retry_after_ms: None,
            scope: None,
            bypassed,
            degraded: !bypassed,
        }
    }

    /// Whole seconds to put in a `Retry-After` header, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms.map(|ms| (ms + 999) / 1000)
    }
}

/// Tenant-aware sliding-window rate limiter.
///
/// This struct is thread-safe and can be shared across handlers.
pub struct RateLimiterService {
    windows: Arc<dyn WindowStore>,
    resolver: RuleResolver,
    bypass: BypassManager,
    metrics: Arc<MetricsRecorder>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    latency_budget: Duration,
    slow_checks: AtomicU64,
}

impl RateLimiterService {
    pub fn new(
        windows: Arc<dyn WindowStore>,
        rules: Arc<dyn RuleStore>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
        config: &RateLimitingConfig,
    ) -> Self {
        Self {
            resolver: RuleResolver::new(rules, Arc::clone(&clock), config.rule_cache_ttl())
                .with_capacity(config.rule_cache_capacity),
            bypass: BypassManager::new(Arc::clone(&windows), Arc::clone(&clock), key_prefix),
            windows,
            metrics: Arc::new(MetricsRecorder::new()),
            clock,
            key_prefix: key_prefix.to_string(),
            latency_budget: config.latency_budget(),
            slow_checks: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    pub fn bypass(&self) -> &BypassManager {
        &self.bypass
    }

    pub fn rule_store(&self) -> &Arc<dyn RuleStore> {
        self.resolver.store()
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of checks that took longer than the latency budget.
    pub fn slow_checks(&self) -> u64 {
        self.slow_checks.load(Ordering::Relaxed)
    }

    fn counter_key(&self, rule: &RateLimitRule, request: &CheckRequest) -> LimitKey {
        LimitKey::new(
            &self.key_prefix,
            rule.scope,
            &request.tenant_id,
            request.user_id.as_deref(),
            endpoint_hash(rule.method.as_deref(), &rule.endpoint_pattern),
        )
    }

    /// Check a request and count it if admitted.
    ///
    /// Store failures are absorbed under `FailOpen` (the request is allowed
    /// and the result marked `degraded`) and returned as errors under
    /// `FailClosed`.
    pub async fn check(
        &self,
        request: &CheckRequest,
        policy: FailurePolicy,
    ) -> Result<RateLimitResult> {
        let started = Instant::now();
        let now = self.clock.now_ms();

        let result = match self.enforce(request, now).await {
            Ok(result) => result,
            Err(e) => match policy {
                FailurePolicy::FailOpen => {
                    warn!(
                        tenant_id = %request.tenant_id,
                        endpoint = %request.endpoint,
                        error = %e,
                        "Rate limit store unavailable, failing open"
                    );
                    self.metrics
                        .record(&request.tenant_id, Decision::Allowed, now);
                    RateLimitResult::unenforced(now, false)
                }
                FailurePolicy::FailClosed => {
                    error!(
                        tenant_id = %request.tenant_id,
                        endpoint = %request.endpoint,
                        error = %e,
                        "Rate limit store unavailable, failing closed"
                    );
                    return Err(e);
                }
            },
        };

        let elapsed = started.elapsed();
        if elapsed > self.latency_budget {
            self.slow_checks.fetch_add(1, Ordering::Relaxed);
            warn!(
                tenant_id = %request.tenant_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.latency_budget.as_millis() as u64,
                "Rate limit check exceeded latency budget"
            );
        }

        Ok(result)
    }

    async fn enforce(&self, request: &CheckRequest, now: u64) -> Result<RateLimitResult> {
        if self.bypass.is_active(&request.tenant_id).await? {
            trace!(tenant_id = %request.tenant_id, "Bypass active, skipping rate limit");
            self.metrics
                .record(&request.tenant_id, Decision::Bypassed, now);
            return Ok(RateLimitResult::unenforced(now, true));
        }

        let rule = self
            .resolver
            .resolve(
                &request.endpoint,
                &request.method,
                &request.tenant_id,
                request.user_id.as_deref(),
            )
            .await?;
        let key = self.counter_key(&rule, request);
        let limit = rule.effective_limit();
        let window_ms = rule.period.as_millis();

        trace!(key = %key, limit, window_ms, "Checking rate limit");

        let outcome = self
            .windows
            .hit(&key.to_redis_key(), limit, window_ms, now)
            .await?;

        let result = RateLimitResult {
            allowed: outcome.allowed,
            current_usage: outcome.count,
            limit,
            remaining: limit.saturating_sub(outcome.count),
            reset_at: (now + outcome.reset_after_ms + 999) / 1000,
            retry_after_ms: outcome.retry_after_ms,
            scope: Some(rule.scope),
            bypassed: false,
            degraded: false,
        };

        if result.allowed {
            self.metrics
                .record(&request.tenant_id, Decision::Allowed, now);
        } else {
            debug!(
                key = %key,
                usage = outcome.count,
                limit,
                retry_after_ms = outcome.retry_after_ms.unwrap_or(0),
                "Rate limit exceeded"
            );
            self.metrics
                .record(&request.tenant_id, Decision::Blocked, now);
            self.record_violation(request, &rule, &result).await;
        }

        Ok(result)
    }

    async fn record_violation(
        &self,
        request: &CheckRequest,
        rule: &RateLimitRule,
        result: &RateLimitResult,
    ) {
        let violation = RateLimitViolation {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            endpoint: request.endpoint.clone(),
            method: request.method.to_ascii_uppercase(),
            rule_scope: rule.scope,
            limit: result.limit,
            current_usage: result.current_usage,
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.rule_store().record_violation(violation).await {
            warn!(
                tenant_id = %request.tenant_id,
                error = %e,
                "Failed to record rate limit violation"
            );
        }
    }

    /// Current usage of the counter a request would hit, without counting it.
    pub async fn usage(&self, request: &CheckRequest) -> Result<RateLimitResult> {
        let now = self.clock.now_ms();
        let rule = self
            .resolver
            .resolve(
                &request.endpoint,
                &request.method,
                &request.tenant_id,
                request.user_id.as_deref(),
            )
            .await?;
        let key = self.counter_key(&rule, request);
        let limit = rule.effective_limit();
        let usage = self
            .windows
            .usage(&key.to_redis_key(), rule.period.as_millis(), now)
            .await?;

        Ok(RateLimitResult {
            allowed: usage < limit,
            current_usage: usage,
            limit,
            remaining: limit.saturating_sub(usage),
            reset_at: (now + rule.period.as_millis()) / 1000,
            retry_after_ms: None,
            scope: Some(rule.scope),
            bypassed: false,
            degraded: false,
        })
    }

    /// Drop every counter of a tenant.
    pub async fn reset_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut removed = 0;
        for prefix in tenant_prefixes(&self.key_prefix, tenant_id) {
            removed += self.windows.clear_prefix(&prefix).await?;
        }
        warn!(tenant_id, removed, "Rate limit counters reset");
        Ok(removed)
    }

    /// Round-trip to the window store.
    pub async fn health(&self) -> Result<()> {
        self.windows.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::{MemoryWindowStore, SlowStore, TimeWindow, UnavailableStore};
    use crate::store::MemoryRuleStore;

    struct Fixture {
        limiter: RateLimiterService,
        rules: Arc<MemoryRuleStore>,
        clock: ManualClock,
    }

    fn fixture_with(windows: Arc<dyn WindowStore>) -> Fixture {
        fixture_with_config(windows, &RateLimitingConfig::default())
    }

    fn fixture_with_config(windows: Arc<dyn WindowStore>, config: &RateLimitingConfig) -> Fixture {
        let rules = Arc::new(MemoryRuleStore::new());
        let clock = ManualClock::new(1_700_000_000_000);
        let limiter = RateLimiterService::new(
            windows,
            rules.clone(),
            Arc::new(clock.clone()),
            "rate_limit",
            config,
        );
        Fixture {
            limiter,
            rules,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryWindowStore::new()))
    }

    async fn add_rule(fixture: &Fixture, rule: RateLimitRule) {
        fixture.rules.insert_rule(rule).await.unwrap();
        fixture.limiter.resolver().invalidate_all();
    }

    fn request(tenant: &str) -> CheckRequest {
        CheckRequest::new(tenant, Some("alice"), "/api/v1/projects", "GET")
    }

    #[tokio::test]
    async fn test_eleventh_request_in_minute_is_rejected() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Org, Some("acme"), 10, TimeWindow::Minute),
        )
        .await;

        for i in 1..=10 {
            let result = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
            assert!(result.allowed, "request {} should be allowed", i);
            assert_eq!(result.current_usage, i);
            assert_eq!(result.remaining, 10 - i);
            f.clock.advance(Duration::from_millis(100));
        }

        let result = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.scope, Some(RuleScope::Org));
        let retry = result.retry_after_secs().unwrap();
        assert!(retry > 0 && retry <= 60, "retry after {}", retry);
    }

    #[tokio::test]
    async fn test_requests_allowed_again_after_window() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Global, None, 2, TimeWindow::Second),
        )
        .await;

        assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        let rejected = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_ms, Some(1_000));

        f.clock.advance(Duration::from_secs(1));
        assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_burst_allowance_extends_limit() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Global, None, 2, TimeWindow::Minute).with_burst(1),
        )
        .await;

        for _ in 0..3 {
            assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        }
        let result = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.limit, 3);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Global, None, 1, TimeWindow::Minute),
        )
        .await;

        assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(!f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(f.limiter.check(&request("globex"), FailurePolicy::FailOpen).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_user_rules_count_per_user() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::User, Some("alice"), 1, TimeWindow::Minute),
        )
        .await;
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::User, Some("bob"), 1, TimeWindow::Minute),
        )
        .await;

        let alice = CheckRequest::new("acme", Some("alice"), "/x", "GET");
        let bob = CheckRequest::new("acme", Some("bob"), "/x", "GET");

        assert!(f.limiter.check(&alice, FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(!f.limiter.check(&alice, FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(f.limiter.check(&bob, FailurePolicy::FailOpen).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_bypass_allows_until_expiry() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Org, Some("acme"), 1, TimeWindow::Hour),
        )
        .await;

        assert!(f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);
        assert!(!f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap().allowed);

        f.limiter
            .bypass()
            .activate("acme", Duration::from_secs(600), "incident", Some("ops"))
            .await
            .unwrap();

        for _ in 0..20 {
            let result = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
            assert!(result.allowed);
            assert!(result.bypassed);
        }

        f.clock.advance(Duration::from_secs(601));
        let result = f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        assert!(!result.allowed);
        assert!(!result.bypassed);
    }

    #[tokio::test]
    async fn test_violation_recorded() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Global, None, 1, TimeWindow::Minute),
        )
        .await;

        f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();

        let violations = f.rules.list_violations(Some("acme"), 10).await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_scope, RuleScope::Global);
        assert_eq!(violations[0].limit, 1);
        assert_eq!(violations[0].user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_usage_and_reset() {
        let f = fixture();
        add_rule(
            &f,
            RateLimitRule::new(RuleScope::Global, None, 5, TimeWindow::Minute),
        )
        .await;

        f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        f.limiter.check(&request("acme"), FailurePolicy::FailOpen).await.unwrap();
        assert_eq!(f.limiter.usage(&request("acme")).await.unwrap().current_usage, 2);

        assert_eq!(f.limiter.reset_tenant("acme").await.unwrap(), 1);
        assert_eq!(f.limiter.usage(&request("acme")).await.unwrap().current_usage, 0);
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        let f = fixture_with(Arc::new(UnavailableStore));

        let result = f
            .limiter
            .check(&request("acme"), FailurePolicy::FailOpen)
            .await
            .unwrap();
        assert!(result.allowed);
        assert!(result.degraded);

        let err = f
            .limiter
            .check(&request("acme"), FailurePolicy::FailClosed)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(f.limiter.health().await.is_err());

        // Only the fail-open request is counted, as allowed.
        let rows = f.limiter.metrics().drain(f.clock.now_ms(), true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, "acme");
        assert_eq!(rows[0].total_requests, 1);
        assert_eq!(rows[0].allowed_requests, 1);
        assert_eq!(rows[0].blocked_requests, 0);
    }

    #[tokio::test]
    async fn test_checks_over_latency_budget_are_counted() {
        let config = RateLimitingConfig {
            latency_budget_ms: 5,
            ..RateLimitingConfig::default()
        };
        let f = fixture_with_config(
            Arc::new(SlowStore::new(Duration::from_millis(20))),
            &config,
        );

        let result = f
            .limiter
            .check(&request("acme"), FailurePolicy::FailOpen)
            .await
            .unwrap();
        assert!(result.allowed);
        assert!(!result.degraded);
        assert_eq!(f.limiter.slow_checks(), 1);

        let fast = fixture();
        fast.limiter
            .check(&request("acme"), FailurePolicy::FailOpen)
            .await
            .unwrap();
        assert_eq!(fast.limiter.slow_checks(), 0);
    }
}
