//! Health, explicit check and admin handlers.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::middleware::{header_value, USER_HEADER};
use super::AppState;
use crate::error::LimiterError;
use crate::ratelimit::{
    BypassStatus, CheckRequest, RateLimitResult, RateLimitRule, SubscriptionPlan,
};
use crate::store::{
    RateLimitMetrics, RateLimitViolation, TenantProfile, TenantRateLimit, TenantRateLimitInput,
};

type ApiResult<T> = std::result::Result<T, ApiError>;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.limiter.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "window_store": "ok" })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check: window store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "window_store": "unavailable" })),
            )
        }
    }
}

pub async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> ApiResult<Json<RateLimitResult>> {
    if request.tenant_id.trim().is_empty() {
        return Err(LimiterError::Validation("tenant_id is required".into()).into());
    }
    let policy = state.config.failure_policy_for(&request.endpoint);
    Ok(Json(state.limiter.check(&request, policy).await?))
}

pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Vec<RateLimitRule>>> {
    Ok(Json(state.limiter.rule_store().list_rules().await?))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<RateLimitRule>,
) -> ApiResult<(StatusCode, Json<RateLimitRule>)> {
    rule.validate()?;
    let rule = state.limiter.rule_store().insert_rule(rule).await?;
    state.limiter.resolver().invalidate_all();

    info!(rule_id = %rule.id, scope = %rule.scope, "Rate limit rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RateLimitRule>> {
    Ok(Json(state.limiter.rule_store().get_rule(id).await?))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.limiter.rule_store().delete_rule(id).await?;
    state.limiter.resolver().invalidate_all();

    info!(rule_id = %id, "Rate limit rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantLimit {
    pub tenant_id: String,
    #[serde(flatten)]
    pub input: TenantRateLimitInput,
}

pub async fn create_tenant_limit(
    State(state): State<AppState>,
    Json(body): Json<CreateTenantLimit>,
) -> ApiResult<(StatusCode, Json<TenantRateLimit>)> {
    if body.tenant_id.trim().is_empty() {
        return Err(LimiterError::Validation("tenant_id is required".into()).into());
    }
    body.input.validate()?;

    let row = state
        .limiter
        .rule_store()
        .create_tenant_limit(&body.tenant_id, body.input)
        .await?;
    state.limiter.resolver().invalidate_tenant(&row.tenant_id);

    info!(
        tenant_id = %row.tenant_id,
        requests = row.requests_per_period,
        period = %row.period,
        "Tenant rate limit created"
    );
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_tenant_limit(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<TenantRateLimit>> {
    state
        .limiter
        .rule_store()
        .active_tenant_limit(&tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            LimiterError::NotFound(format!("rate limit for tenant {}", tenant_id)).into()
        })
}

pub async fn update_tenant_limit(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(input): Json<TenantRateLimitInput>,
) -> ApiResult<Json<TenantRateLimit>> {
    input.validate()?;
    let row = state
        .limiter
        .rule_store()
        .update_tenant_limit(&tenant_id, input)
        .await?;
    state.limiter.resolver().invalidate_tenant(&tenant_id);

    info!(tenant_id = %tenant_id, requests = row.requests_per_period, "Tenant rate limit updated");
    Ok(Json(row))
}

/// Body of a tenant profile update.
#[derive(Debug, Deserialize)]
pub struct TenantProfileInput {
    #[serde(default)]
    pub plan: SubscriptionPlan,
    #[serde(default)]
    pub sic_code: Option<String>,
}

pub async fn get_tenant_profile(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<TenantProfile>> {
    state
        .limiter
        .rule_store()
        .tenant_profile(&tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| LimiterError::NotFound(format!("profile for tenant {}", tenant_id)).into())
}

pub async fn put_tenant_profile(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(input): Json<TenantProfileInput>,
) -> ApiResult<Json<TenantProfile>> {
    let profile = state
        .limiter
        .rule_store()
        .upsert_tenant_profile(TenantProfile {
            tenant_id: tenant_id.clone(),
            plan: input.plan,
            sic_code: input.sic_code,
        })
        .await?;
    state.limiter.resolver().invalidate_tenant(&tenant_id);

    info!(tenant_id = %tenant_id, plan = %profile.plan, "Tenant profile updated");
    Ok(Json(profile))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub hard: bool,
}

pub async fn delete_tenant_limit(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<StatusCode> {
    state
        .limiter
        .rule_store()
        .delete_tenant_limit(&tenant_id, params.hard)
        .await?;
    state.limiter.resolver().invalidate_tenant(&tenant_id);

    info!(tenant_id = %tenant_id, hard = params.hard, "Tenant rate limit deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct BypassState {
    pub active: bool,
    #[serde(flatten)]
    pub status: Option<BypassStatus>,
}

pub async fn bypass_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<BypassState>> {
    let status = state.limiter.bypass().status(&tenant_id).await?;
    Ok(Json(BypassState {
        active: status.is_some(),
        status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActivateBypass {
    pub duration_minutes: u64,
    pub reason: String,
    #[serde(default)]
    pub activated_by: Option<String>,
}

pub async fn activate_bypass(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActivateBypass>,
) -> ApiResult<(StatusCode, Json<BypassState>)> {
    let activated_by = body
        .activated_by
        .or_else(|| header_value(&headers, USER_HEADER));
    let duration = Duration::from_secs(body.duration_minutes.saturating_mul(60));

    let status = state
        .limiter
        .bypass()
        .activate(&tenant_id, duration, &body.reason, activated_by.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(BypassState {
            active: true,
            status: Some(status),
        }),
    ))
}

pub async fn remove_bypass(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let removed_by = header_value(&headers, USER_HEADER);
    if state
        .limiter
        .bypass()
        .deactivate(&tenant_id, removed_by.as_deref())
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(LimiterError::NotFound(format!("bypass for tenant {}", tenant_id)).into())
    }
}

pub async fn reset_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cleared = state.limiter.reset_tenant(&tenant_id).await?;
    Ok(Json(json!({ "tenant_id": tenant_id, "cleared_keys": cleared })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub tenant_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListParams {
    fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

pub async fn list_violations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<RateLimitViolation>>> {
    Ok(Json(
        state
            .limiter
            .rule_store()
            .list_violations(params.tenant_id.as_deref(), params.page_size())
            .await?,
    ))
}

pub async fn list_metrics(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<RateLimitMetrics>>> {
    Ok(Json(
        state
            .limiter
            .rule_store()
            .list_metrics(params.tenant_id.as_deref(), params.page_size())
            .await?,
    ))
}
