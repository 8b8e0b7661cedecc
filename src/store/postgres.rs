//! PostgreSQL rule store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use tracing::info;
use uuid::Uuid;

use super::models::{
    RateLimitMetrics, RateLimitViolation, TenantProfile, TenantRateLimit, TenantRateLimitInput,
};
use super::RuleStore;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{RateLimitRule, RuleScope, SubscriptionPlan, TimeWindow};

const SCHEMA: &str = include_str!("../../migrations/0001_rate_limits.sql");

/// SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

const RULE_COLUMNS: &str = "id, scope, scope_value, endpoint_pattern, method, \
     requests_per_period, period, burst_allowance, priority, enabled, name";

const TENANT_LIMIT_COLUMNS: &str = "id, tenant_id, requests_per_period, period, \
     burst_allowance, notes, is_active, created_at, updated_at";

/// Rule store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        info!("Rate limit schema is up to date");
        Ok(())
    }
}

fn corrupt(column: &str, value: &str) -> LimiterError {
    LimiterError::Store(format!("unexpected {} value in database: {:?}", column, value))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn rule_from_row(row: &PgRow) -> Result<RateLimitRule> {
    let scope: String = row.try_get("scope")?;
    let period: String = row.try_get("period")?;
    let burst: Option<i64> = row.try_get("burst_allowance")?;
    Ok(RateLimitRule {
        id: row.try_get("id")?,
        scope: RuleScope::parse(&scope).ok_or_else(|| corrupt("scope", &scope))?,
        scope_value: row.try_get("scope_value")?,
        endpoint_pattern: row.try_get("endpoint_pattern")?,
        method: row.try_get("method")?,
        requests_per_period: row.try_get::<i64, _>("requests_per_period")?.max(0) as u64,
        period: TimeWindow::parse(&period).ok_or_else(|| corrupt("period", &period))?,
        burst_allowance: burst.map(|b| b.max(0) as u64),
        priority: row.try_get("priority")?,
        enabled: row.try_get("enabled")?,
        name: row.try_get("name")?,
    })
}

fn tenant_limit_from_row(row: &PgRow) -> Result<TenantRateLimit> {
    let period: String = row.try_get("period")?;
    let burst: Option<i64> = row.try_get("burst_allowance")?;
    Ok(TenantRateLimit {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        requests_per_period: row.try_get::<i64, _>("requests_per_period")?.max(0) as u64,
        period: TimeWindow::parse(&period).ok_or_else(|| corrupt("period", &period))?,
        burst_allowance: burst.map(|b| b.max(0) as u64),
        notes: row.try_get("notes")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn violation_from_row(row: &PgRow) -> Result<RateLimitViolation> {
    let scope: String = row.try_get("rule_scope")?;
    Ok(RateLimitViolation {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        endpoint: row.try_get("endpoint")?,
        method: row.try_get("method")?,
        rule_scope: RuleScope::parse(&scope).ok_or_else(|| corrupt("rule_scope", &scope))?,
        limit: row.try_get::<i64, _>("limit_value")?.max(0) as u64,
        current_usage: row.try_get::<i64, _>("current_usage")?.max(0) as u64,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn metrics_from_row(row: &PgRow) -> Result<RateLimitMetrics> {
    Ok(RateLimitMetrics {
        tenant_id: row.try_get("tenant_id")?,
        bucket_start: row.try_get("bucket_start")?,
        total_requests: row.try_get::<i64, _>("total_requests")?.max(0) as u64,
        allowed_requests: row.try_get::<i64, _>("allowed_requests")?.max(0) as u64,
        blocked_requests: row.try_get::<i64, _>("blocked_requests")?.max(0) as u64,
        bypassed_requests: row.try_get::<i64, _>("bypassed_requests")?.max(0) as u64,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn candidate_rules(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        profile: &TenantProfile,
    ) -> Result<Vec<RateLimitRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM rate_limit_rules \
             WHERE enabled AND ( \
               scope = 'global' \
               OR (scope = 'user' AND scope_value = $1) \
               OR (scope = 'org' AND scope_value = $2) \
               OR (scope = 'industry' AND $3 LIKE scope_value || '%') \
               OR (scope = 'plan' AND lower(scope_value) = $4))"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(tenant_id)
            .bind(profile.sic_code.as_deref())
            .bind(profile.plan.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM rate_limit_rules ORDER BY scope, priority DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn get_rule(&self, id: Uuid) -> Result<RateLimitRule> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM rate_limit_rules WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LimiterError::NotFound(format!("rule {}", id)))?;
        rule_from_row(&row)
    }

    async fn insert_rule(&self, rule: RateLimitRule) -> Result<RateLimitRule> {
        let result = sqlx::query(
            "INSERT INTO rate_limit_rules \
             (id, scope, scope_value, endpoint_pattern, method, requests_per_period, \
              period, burst_allowance, priority, enabled, name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(rule.id)
        .bind(rule.scope.as_str())
        .bind(rule.scope_value.as_deref())
        .bind(&rule.endpoint_pattern)
        .bind(rule.method.as_deref())
        .bind(to_i64(rule.requests_per_period))
        .bind(rule.period.as_str())
        .bind(rule.burst_allowance.map(to_i64))
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.name.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(rule),
            Err(e) if is_unique_violation(&e) => Err(LimiterError::Conflict(format!(
                "rule {} already exists",
                rule.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_rule(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM rate_limit_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LimiterError::NotFound(format!("rule {}", id)));
        }
        Ok(())
    }

    async fn tenant_profile(&self, tenant_id: &str) -> Result<Option<TenantProfile>> {
        let row = sqlx::query("SELECT id, subscription_plan, sic_code FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<TenantProfile> {
            let plan: String = row.try_get("subscription_plan")?;
            Ok(TenantProfile {
                tenant_id: row.try_get("id")?,
                plan: SubscriptionPlan::parse(&plan),
                sic_code: row.try_get("sic_code")?,
            })
        })
        .transpose()
    }

    async fn upsert_tenant_profile(&self, profile: TenantProfile) -> Result<TenantProfile> {
        profile.validate()?;
        sqlx::query(
            "INSERT INTO tenants (id, subscription_plan, sic_code) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE \
             SET subscription_plan = EXCLUDED.subscription_plan, sic_code = EXCLUDED.sic_code",
        )
        .bind(&profile.tenant_id)
        .bind(profile.plan.as_str())
        .bind(&profile.sic_code)
        .execute(&self.pool)
        .await?;
        Ok(profile)
    }

    async fn active_tenant_limit(&self, tenant_id: &str) -> Result<Option<TenantRateLimit>> {
        let sql = format!(
            "SELECT {TENANT_LIMIT_COLUMNS} FROM tenant_rate_limits \
             WHERE tenant_id = $1 AND is_active"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tenant_limit_from_row).transpose()
    }

    async fn create_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit> {
        let row = TenantRateLimit::new(tenant_id, input, Utc::now());
        let result = sqlx::query(
            "INSERT INTO tenant_rate_limits \
             (id, tenant_id, requests_per_period, period, burst_allowance, notes, \
              is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)",
        )
        .bind(row.id)
        .bind(&row.tenant_id)
        .bind(to_i64(row.requests_per_period))
        .bind(row.period.as_str())
        .bind(row.burst_allowance.map(to_i64))
        .bind(row.notes.as_deref())
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(row),
            // The partial unique index on active rows enforces one per tenant.
            Err(e) if is_unique_violation(&e) => Err(LimiterError::Conflict(format!(
                "tenant {} already has an active rate limit",
                tenant_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_tenant_limit(
        &self,
        tenant_id: &str,
        input: TenantRateLimitInput,
    ) -> Result<TenantRateLimit> {
        let sql = format!(
            "UPDATE tenant_rate_limits \
             SET requests_per_period = $2, period = $3, burst_allowance = $4, \
                 notes = $5, updated_at = $6 \
             WHERE tenant_id = $1 AND is_active \
             RETURNING {TENANT_LIMIT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(to_i64(input.requests_per_period))
            .bind(input.period.as_str())
            .bind(input.burst_allowance.map(to_i64))
            .bind(input.notes.as_deref())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LimiterError::NotFound(format!("rate limit for tenant {}", tenant_id)))?;
        tenant_limit_from_row(&row)
    }

    async fn delete_tenant_limit(&self, tenant_id: &str, hard: bool) -> Result<()> {
        let result = if hard {
            sqlx::query("DELETE FROM tenant_rate_limits WHERE tenant_id = $1")
                .bind(tenant_id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                "UPDATE tenant_rate_limits SET is_active = FALSE, updated_at = $2 \
                 WHERE tenant_id = $1 AND is_active",
            )
            .bind(tenant_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(LimiterError::NotFound(format!(
                "rate limit for tenant {}",
                tenant_id
            )));
        }
        Ok(())
    }

    async fn record_violation(&self, violation: RateLimitViolation) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_violations \
             (id, tenant_id, user_id, endpoint, method, rule_scope, limit_value, \
              current_usage, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(violation.id)
        .bind(&violation.tenant_id)
        .bind(violation.user_id.as_deref())
        .bind(&violation.endpoint)
        .bind(&violation.method)
        .bind(violation.rule_scope.as_str())
        .bind(to_i64(violation.limit))
        .bind(to_i64(violation.current_usage))
        .bind(violation.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_violations(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitViolation>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, user_id, endpoint, method, rule_scope, limit_value, \
                    current_usage, occurred_at \
             FROM rate_limit_violations \
             WHERE ($1::TEXT IS NULL OR tenant_id = $1) \
             ORDER BY occurred_at DESC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(violation_from_row).collect()
    }

    async fn merge_metrics(&self, metrics: &[RateLimitMetrics]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in metrics {
            sqlx::query(
                "INSERT INTO rate_limit_metrics \
                 (tenant_id, bucket_start, total_requests, allowed_requests, \
                  blocked_requests, bypassed_requests) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (tenant_id, bucket_start) DO UPDATE SET \
                   total_requests = rate_limit_metrics.total_requests + EXCLUDED.total_requests, \
                   allowed_requests = rate_limit_metrics.allowed_requests + EXCLUDED.allowed_requests, \
                   blocked_requests = rate_limit_metrics.blocked_requests + EXCLUDED.blocked_requests, \
                   bypassed_requests = rate_limit_metrics.bypassed_requests + EXCLUDED.bypassed_requests",
            )
            .bind(&row.tenant_id)
            .bind(row.bucket_start)
            .bind(to_i64(row.total_requests))
            .bind(to_i64(row.allowed_requests))
            .bind(to_i64(row.blocked_requests))
            .bind(to_i64(row.bypassed_requests))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_metrics(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitMetrics>> {
        let rows = sqlx::query(
            "SELECT tenant_id, bucket_start, total_requests, allowed_requests, \
                    blocked_requests, bypassed_requests \
             FROM rate_limit_metrics \
             WHERE ($1::TEXT IS NULL OR tenant_id = $1) \
             ORDER BY bucket_start DESC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(metrics_from_row).collect()
    }
}
