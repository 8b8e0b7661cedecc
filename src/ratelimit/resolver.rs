//! Rule resolution across the user > org > industry > plan > global
//! hierarchy, with a TTL cache in front of the rule store.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::Clock;
use super::defaults::default_rule;
use super::rules::{pick_best, RateLimitRule, RuleScope};
use crate::error::Result;
use crate::store::{RuleStore, TenantProfile, TenantRateLimit};

/// Default upper bound on cached resolutions.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Levels checked by the resolver, most specific first.
const RESOLUTION_ORDER: [RuleScope; 5] = [
    RuleScope::User,
    RuleScope::Org,
    RuleScope::Industry,
    RuleScope::Plan,
    RuleScope::Global,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    user_id: Option<String>,
    method: String,
    endpoint: String,
}

struct CachedRule {
    rule: Arc<RateLimitRule>,
    expires_at_ms: u64,
}

/// Choose the rule for a caller from already-loaded candidates.
///
/// Rules are re-checked against the caller so that stores may over-select.
/// An active tenant configuration stands in for an organisation rule when
/// no explicit one matches; with nothing at all, a default is synthesized
/// from the plan and industry.
pub fn select_rule(
    candidates: &[RateLimitRule],
    tenant_limit: Option<&TenantRateLimit>,
    profile: &TenantProfile,
    endpoint: &str,
    method: &str,
    tenant_id: &str,
    user_id: Option<&str>,
) -> RateLimitRule {
    for scope in RESOLUTION_ORDER {
        let matching = candidates.iter().filter(|rule| {
            rule.enabled
                && rule.scope == scope
                && rule.matches_endpoint(endpoint, method)
                && match scope {
                    RuleScope::User => user_id.map_or(false, |user| rule.applies_to(user)),
                    RuleScope::Org => rule.applies_to(tenant_id),
                    RuleScope::Industry => profile
                        .sic_code
                        .as_deref()
                        .map_or(false, |sic| rule.applies_to(sic)),
                    RuleScope::Plan => rule.applies_to(profile.plan.as_str()),
                    RuleScope::Global => true,
                }
        });

        if let Some(best) = pick_best(matching) {
            return best.clone();
        }

        if scope == RuleScope::Org {
            if let Some(limit) = tenant_limit.filter(|l| l.is_active) {
                return limit.as_rule();
            }
        }
    }

    default_rule(profile.plan, profile.sic_code.as_deref())
}

/// Resolves and caches the rule applying to each request.
pub struct RuleResolver {
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
    cache: DashMap<CacheKey, CachedRule>,
    ttl_ms: u64,
    capacity: usize,
}

impl RuleResolver {
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            cache: DashMap::new(),
            ttl_ms: ttl.as_millis() as u64,
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Bound the cache to `capacity` entries.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// Return the highest-priority rule for a request.
    pub async fn resolve(
        &self,
        endpoint: &str,
        method: &str,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Result<Arc<RateLimitRule>> {
        let key = CacheKey {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.map(str::to_string),
            method: method.to_ascii_uppercase(),
            endpoint: endpoint.to_string(),
        };
        let now = self.clock.now_ms();

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at_ms > now {
                trace!(tenant_id, endpoint, "Rule cache hit");
                return Ok(Arc::clone(&cached.rule));
            }
        }

        let profile = self
            .store
            .tenant_profile(tenant_id)
            .await?
            .unwrap_or_else(|| TenantProfile::unknown(tenant_id));
        let candidates = self
            .store
            .candidate_rules(tenant_id, user_id, &profile)
            .await?;
        let tenant_limit = self.store.active_tenant_limit(tenant_id).await?;

        let rule = Arc::new(select_rule(
            &candidates,
            tenant_limit.as_ref(),
            &profile,
            endpoint,
            method,
            tenant_id,
            user_id,
        ));

        debug!(
            tenant_id,
            endpoint,
            method,
            scope = %rule.scope,
            limit = rule.effective_limit(),
            period = %rule.period,
            "Resolved rate limit rule"
        );

        if self.cache.len() >= self.capacity {
            self.make_room(now);
        }
        self.cache.insert(
            key,
            CachedRule {
                rule: Arc::clone(&rule),
                expires_at_ms: now + self.ttl_ms,
            },
        );

        Ok(rule)
    }

    /// Drop expired entries, then the oldest ones until the cache is back
    /// under nine tenths of its capacity.
    fn make_room(&self, now: u64) {
        self.cache.retain(|_, cached| cached.expires_at_ms > now);

        let target = self.capacity - self.capacity / 10 - 1;
        let len = self.cache.len();
        if len <= target {
            return;
        }

        let mut entries: Vec<(u64, CacheKey)> = self
            .cache
            .iter()
            .map(|entry| (entry.value().expires_at_ms, entry.key().clone()))
            .collect();
        entries.sort_unstable_by_key(|(expires_at_ms, _)| *expires_at_ms);

        let evicted = len - target;
        for (_, key) in entries.into_iter().take(evicted) {
            self.cache.remove(&key);
        }
        debug!(evicted, capacity = self.capacity, "Evicted cached rule resolutions");
    }

    /// Forget every cached resolution.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Forget cached resolutions of one tenant.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        self.cache.retain(|key, _| key.tenant_id != tenant_id);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::{SubscriptionPlan, TimeWindow};
    use crate::store::{MemoryRuleStore, TenantRateLimitInput};

    fn profile() -> TenantProfile {
        TenantProfile {
            tenant_id: "acme".into(),
            plan: SubscriptionPlan::Professional,
            sic_code: Some("6021".into()),
        }
    }

    fn rule(scope: RuleScope, value: Option<&str>, requests: u64) -> RateLimitRule {
        RateLimitRule::new(scope, value, requests, TimeWindow::Minute)
    }

    fn select(candidates: &[RateLimitRule], user: Option<&str>) -> RateLimitRule {
        select_rule(candidates, None, &profile(), "/api/v1/items", "GET", "acme", user)
    }

    #[test]
    fn test_user_rule_wins_regardless_of_order() {
        let user = rule(RuleScope::User, Some("alice"), 1);
        let others = vec![
            rule(RuleScope::Global, None, 1000).with_priority(100),
            rule(RuleScope::Plan, Some("professional"), 500).with_priority(100),
            rule(RuleScope::Industry, Some("60"), 300).with_priority(100),
            rule(RuleScope::Org, Some("acme"), 200).with_priority(100),
        ];

        for position in 0..=others.len() {
            let mut candidates = others.clone();
            candidates.insert(position, user.clone());
            assert_eq!(select(&candidates, Some("alice")).id, user.id);
            candidates.reverse();
            assert_eq!(select(&candidates, Some("alice")).id, user.id);
        }
    }

    #[test]
    fn test_levels_fall_through_in_order() {
        let mut candidates = vec![
            rule(RuleScope::Global, None, 1000),
            rule(RuleScope::Plan, Some("professional"), 500),
            rule(RuleScope::Industry, Some("60"), 300),
            rule(RuleScope::Org, Some("acme"), 200),
            rule(RuleScope::User, Some("bob"), 1),
        ];

        assert_eq!(select(&candidates, Some("alice")).scope, RuleScope::Org);
        candidates.retain(|r| r.scope != RuleScope::Org);
        assert_eq!(select(&candidates, Some("alice")).scope, RuleScope::Industry);
        candidates.retain(|r| r.scope != RuleScope::Industry);
        assert_eq!(select(&candidates, Some("alice")).scope, RuleScope::Plan);
        candidates.retain(|r| r.scope != RuleScope::Plan);
        assert_eq!(select(&candidates, Some("alice")).scope, RuleScope::Global);
    }

    #[test]
    fn test_non_matching_rules_are_skipped() {
        let candidates = vec![
            rule(RuleScope::User, Some("alice"), 1).with_endpoint("/admin/*"),
            rule(RuleScope::Org, Some("other-tenant"), 2),
            rule(RuleScope::Plan, Some("free"), 3),
            {
                let mut disabled = rule(RuleScope::Global, None, 4);
                disabled.enabled = false;
                disabled
            },
        ];

        let selected = select(&candidates, Some("alice"));
        assert_eq!(selected.name.as_deref(), Some("default:professional"));
        // Professional (1000/min) in banking (x1.5).
        assert_eq!(selected.requests_per_period, 1500);
    }

    #[test]
    fn test_tenant_config_stands_in_for_org_rule() {
        let limit = crate::store::TenantRateLimit::new(
            "acme",
            TenantRateLimitInput {
                requests_per_period: 42,
                period: TimeWindow::Hour,
                burst_allowance: None,
                notes: None,
            },
            chrono::Utc::now(),
        );
        let candidates = vec![rule(RuleScope::Plan, Some("professional"), 500)];

        let selected = select_rule(
            &candidates,
            Some(&limit),
            &profile(),
            "/x",
            "GET",
            "acme",
            None,
        );
        assert_eq!(selected.scope, RuleScope::Org);
        assert_eq!(selected.requests_per_period, 42);

        // An explicit org rule takes precedence over the tenant configuration.
        let explicit = rule(RuleScope::Org, Some("acme"), 7);
        let selected = select_rule(
            &[explicit.clone()],
            Some(&limit),
            &profile(),
            "/x",
            "GET",
            "acme",
            None,
        );
        assert_eq!(selected.id, explicit.id);
    }

    #[tokio::test]
    async fn test_resolve_caches_until_ttl() {
        let store = Arc::new(MemoryRuleStore::new());
        let clock = ManualClock::new(0);
        let resolver = RuleResolver::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(300),
        );

        let first = resolver.resolve("/a", "GET", "acme", None).await.unwrap();
        assert_eq!(first.scope, RuleScope::Plan);

        store
            .insert_rule(rule(RuleScope::Org, Some("acme"), 5))
            .await
            .unwrap();

        // Still served from cache.
        let cached = resolver.resolve("/a", "get", "acme", None).await.unwrap();
        assert_eq!(cached.id, first.id);

        clock.advance(Duration::from_secs(301));
        let fresh = resolver.resolve("/a", "GET", "acme", None).await.unwrap();
        assert_eq!(fresh.scope, RuleScope::Org);
    }

    #[tokio::test]
    async fn test_invalidate_tenant() {
        let store = Arc::new(MemoryRuleStore::new());
        let resolver = RuleResolver::new(
            store.clone(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(300),
        );

        resolver.resolve("/a", "GET", "acme", None).await.unwrap();
        resolver.resolve("/a", "GET", "globex", None).await.unwrap();
        assert_eq!(resolver.cached_entries(), 2);

        resolver.invalidate_tenant("acme");
        assert_eq!(resolver.cached_entries(), 1);

        resolver.invalidate_all();
        assert_eq!(resolver.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_seeded_profiles_reach_plan_and_industry_rules() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/rules.yaml");
        let store = Arc::new(MemoryRuleStore::with_rules(
            crate::ratelimit::RuleSet::from_file(path).unwrap(),
        ));
        let resolver = RuleResolver::new(
            store,
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(300),
        );

        let county = resolver
            .resolve("/api/v1/records", "GET", "county-records", None)
            .await
            .unwrap();
        assert_eq!(county.scope, RuleScope::Industry);
        assert_eq!(county.name.as_deref(), Some("public-administration"));

        let acme = resolver
            .resolve("/api/v1/projects", "GET", "acme", None)
            .await
            .unwrap();
        assert_eq!(acme.scope, RuleScope::Plan);
        assert_eq!(acme.effective_limit(), 5500);

        let unknown = resolver
            .resolve("/api/v1/projects", "GET", "globex", None)
            .await
            .unwrap();
        assert_eq!(unknown.name.as_deref(), Some("global-default"));
    }

    #[tokio::test]
    async fn test_cache_stays_within_capacity() {
        let store = Arc::new(MemoryRuleStore::new());
        let clock = ManualClock::new(0);
        let resolver = RuleResolver::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(300),
        )
        .with_capacity(100);

        for i in 0..250u64 {
            clock.set(i);
            let endpoint = format!("/items/{}", i);
            resolver.resolve(&endpoint, "GET", "acme", None).await.unwrap();
            assert!(resolver.cached_entries() <= 100);
        }

        // The newest resolution survives eviction and is still served from cache.
        store
            .insert_rule(rule(RuleScope::Org, Some("acme"), 5))
            .await
            .unwrap();
        let cached = resolver
            .resolve("/items/249", "GET", "acme", None)
            .await
            .unwrap();
        assert_eq!(cached.scope, RuleScope::Plan);

        // The oldest one was evicted and resolves afresh.
        let fresh = resolver.resolve("/items/0", "GET", "acme", None).await.unwrap();
        assert_eq!(fresh.scope, RuleScope::Org);
    }
}
