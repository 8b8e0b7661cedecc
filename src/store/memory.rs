//! In-memory rule store, optionally seeded from a YAML rule file.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::{
    RateLimitMetrics, RateLimitViolation, TenantProfile, TenantRateLimit, TenantRateLimitInput,
};
use super::RuleStore;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{RateLimitRule, RuleScope, RuleSet};

#[derive(Default)]
struct Tables {
    rules: Vec<RateLimitRule>,
    profiles: HashMap<String, TenantProfile>,
    tenant_limits: Vec<TenantRateLimit>,
    violations: Vec<RateLimitViolation>,
    metrics: HashMap<(String, i64), RateLimitMetrics>,
}

/// Rule store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryRuleStore {
    tables: RwLock<Tables>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the rules and tenant profiles of a rule set.
    pub fn with_rules(set: RuleSet) -> Self {
        let store = Self::new();
        store.tables.write().rules = set.rules;
        for profile in set.tenants {
            store.put_tenant_profile(profile);
        }
        store
    }

    /// Register or replace a tenant's plan and SIC code.
    pub fn put_tenant_profile(&self, profile: TenantProfile) {
        self.tables
            .write()
            .profiles
            .insert(profile.tenant_id.clone(), profile);
    }
}

fn sort_recent_first<T, F>(mut rows: Vec<T>, limit: usize, key: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::DateTime<Utc>,
{
    rows.sort_by_key(|row| std::cmp::Reverse(key(row)));
    rows.truncate(limit);
    rows
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn candidate_rules(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        profile: &TenantProfile,
    ) -> Result<Vec<RateLimitRule>> {
        let tables = self.tables.read();
        Ok(tables
            .rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| match rule.scope {
                RuleScope::Global => true,
                RuleScope::Plan => rule.applies_to(profile.plan.as_str()),
                RuleScope::Industry => profile
                    .sic_code
                    .as_deref()
                    .map_or(false, |sic| rule.applies_to(sic)),
                RuleScope::Org => rule.applies_to(tenant_id),
                RuleScope::User => user_id.map_or(false, |user| rule.applies_to(user)),
            })
            .cloned()
            .collect())
    }

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>> {
        Ok(self.tables.read().rules.clone())
    }

    async fn get_rule(&self, id: Uuid) -> Result<RateLimitRule> {
        self.tables
            .read()
            .rules
            .iter()
            .find(|rule| rule.id == id)
            .cloned()
            .ok_or_else(|| LimiterError::NotFound(format!("rule {}", id)))
    }

    async fn insert_rule(&self, rule: RateLimitRule) -> Result<RateLimitRule> {
        let mut tables = self.tables.write();
        if tables.rules.iter().any(|existing| existing.id == rule.id) {
            return Err(LimiterError::Conflict(format!("rule {} already exists", rule.id)));
        }
        tables.rules.push(rule.clone());
        Ok(rule)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        let before = tables.rules.len();
        tables.rules.retain(|rule| rule.id != id);
        if tables.rules.len() == before {
            return Err(LimiterError::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>> {
        Ok(self.tables.read().profiles.get(tenant_id).cloned())
    }

    async fn upsert_tenant_profile(&self, profile: TenantProfile) -> Result<TenantProfile> {
        profile.validate()?;
        self.put_tenant_profile(profile.clone());
        Ok(profile)
    }

    async fn active_tenant_limit(&self, tenant_id: &str) -> Result<Option<TenantRateLimit>> {
        Ok(self
            .tables
            .read()
            .tenant_limits
            .iter()
            .find(|row| row.tenant_id == tenant_id && row.is_active)
            .cloned())
    }

    async fn create_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit> {
        let mut tables = self.tables.write();
        if tables
            .tenant_limits
            .iter()
            .any(|row| row.tenant_id == tenant_id && row.is_active)
        {
            return Err(LimiterError::Conflict(format!(
                "tenant {} already has an active rate limit",
                tenant_id
            )));
        }
        let row = TenantRateLimit::new(tenant_id, input, Utc::now());
        tables.tenant_limits.push(row.clone());
        Ok(row)
    }

    async fn update_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit> {
        let mut tables = self.tables.write();
        let row = tables
            .tenant_limits
            .iter_mut()
            .find(|row| row.tenant_id == tenant_id && row.is_active)
            .ok_or_else(|| LimiterError::NotFound(format!("rate limit for tenant {}", tenant_id)))?;
        row.apply(input, Utc::now());
        Ok(row.clone())
    }

    async fn delete_tenant_limit(&self, tenant_id: &str, hard: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let exists = tables
            .tenant_limits
            .iter()
            .any(|row| row.tenant_id == tenant_id && (hard || row.is_active));
        if !exists {
            return Err(LimiterError::NotFound(format!(
                "rate limit for tenant {}",
                tenant_id
            )));
        }

        if hard {
            tables.tenant_limits.retain(|row| row.tenant_id != tenant_id);
        } else {
            let now = Utc::now();
            for row in tables
                .tenant_limits
                .iter_mut()
                .filter(|row| row.tenant_id == tenant_id && row.is_active)
            {
                row.is_active = false;
                row.updated_at = now;
            }
        }
        Ok(())
    }

    async fn record_violation(&self, violation: RateLimitViolation) -> Result<()> {
        self.tables.write().violations.push(violation);
        Ok(())
    }

    async fn list_violations(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitViolation>> {
        let rows: Vec<RateLimitViolation> = self
            .tables
            .read()
            .violations
            .iter()
            .filter(|v| tenant_id.map_or(true, |t| v.tenant_id == t))
            .cloned()
            .collect();
        Ok(sort_recent_first(rows, limit, |v| v.occurred_at))
    }

    async fn merge_metrics(&self, metrics: &[RateLimitMetrics]) -> Result<()> {
        let mut tables = self.tables.write();
        for row in metrics {
            tables
                .metrics
                .entry((row.tenant_id.clone(), row.bucket_start.timestamp()))
                .or_insert_with(|| RateLimitMetrics::empty(&row.tenant_id, row.bucket_start))
                .merge(row);
        }
        Ok(())
    }

    async fn list_metrics(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitMetrics>> {
        let rows: Vec<RateLimitMetrics> = self
            .tables
            .read()
            .metrics
            .values()
            .filter(|m| tenant_id.map_or(true, |t| m.tenant_id == t))
            .cloned()
            .collect();
        Ok(sort_recent_first(rows, limit, |m| m.bucket_start))
    }
}
