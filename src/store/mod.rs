//! Relational persistence for rules, tenant configuration, violations and
//! aggregated metrics.

mod memory;
mod models;
mod postgres;

pub use memory::MemoryRuleStore;
pub use models::{
    RateLimitMetrics, RateLimitViolation, TenantProfile, TenantRateLimit, TenantRateLimitInput,
};
pub use postgres::PgRuleStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::RateLimitRule;

/// Trait for the relational store behind rule resolution and the admin API.
///
/// Read paths (`candidate_rules`, `tenant_profile`, `active_tenant_limit`)
/// are hit on rule-cache misses only; writes come from admin actions and
/// the background aggregator.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules that can apply to this caller at any scope.
    ///
    /// Implementations may over-select; the resolver re-checks every rule.
    async fn candidate_rules(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        profile: &TenantProfile,
    ) -> Result<Vec<RateLimitRule>>;

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>>;

    async fn get_rule(&self, id: Uuid) -> Result<RateLimitRule>;

    async fn insert_rule(&self, rule: RateLimitRule) -> Result<RateLimitRule>;

    async fn delete_rule(&self, id: Uuid) -> Result<()>;

    /// Plan and SIC code of a tenant, if the tenant is known.
    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>>;

    /// Register or replace a tenant's plan and SIC code.
    async fn upsert_tenant_profile(&self, profile: TenantProfile) -> Result<TenantProfile>;

    async fn active_tenant_limit(&self, tenant_id: &str) -> Result<Option<TenantRateLimit>>;

    /// Fails with `Conflict` when the tenant already has an active row.
    async fn create_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit>;

    /// Fails with `NotFound` when the tenant has no active row.
    async fn update_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit>;

    /// Deactivate (soft) or remove (hard) the tenant's configuration.
    async fn delete_tenant_limit(&self, tenant_id: &str, hard: bool) -> Result<()>;

    async fn record_violation(&self, violation: RateLimitViolation) -> Result<()>;

    /// Most recent violations first.
    async fn list_violations(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitViolation>>;

    /// Add the counts to existing rows for the same tenant and bucket.
    async fn merge_metrics(&self, metrics: &[RateLimitMetrics]) -> Result<()>;

    /// Most recent buckets first.
    async fn list_metrics(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitMetrics>>;
}
