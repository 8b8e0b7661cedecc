//! HTTP surface: rate limiting middleware, explicit check endpoint and the
//! admin API.

mod admin;
mod error;
mod middleware;
mod server;

pub use error::{ApiError, ErrorResponse};
pub use middleware::{rate_limit, TENANT_HEADER, USER_HEADER};
pub use server::HttpServer;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::config::RateLimitingConfig;
use crate::ratelimit::RateLimiterService;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiterService>,
    pub config: Arc<RateLimitingConfig>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiterService>, config: RateLimitingConfig) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
        }
    }
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/rules", get(admin::list_rules).post(admin::create_rule))
        .route("/rules/:id", get(admin::get_rule).delete(admin::delete_rule))
        .route("/tenants", post(admin::create_tenant_limit))
        .route(
            "/tenants/:tenant_id",
            get(admin::get_tenant_limit)
                .put(admin::update_tenant_limit)
                .delete(admin::delete_tenant_limit),
        )
        .route(
            "/tenants/:tenant_id/bypass",
            get(admin::bypass_status)
                .post(admin::activate_bypass)
                .delete(admin::remove_bypass),
        )
        .route(
            "/tenants/:tenant_id/profile",
            get(admin::get_tenant_profile).put(admin::put_tenant_profile),
        )
        .route("/tenants/:tenant_id/reset", post(admin::reset_tenant))
        .route("/violations", get(admin::list_violations))
        .route("/metrics", get(admin::list_metrics))
}

/// Build the service router.
///
/// Admin routes sit behind the rate limiting middleware like any other
/// tenant traffic; the health and explicit check endpoints do not.
pub fn router(state: AppState) -> Router {
    let admin_api = admin_routes().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::rate_limit,
    ));

    Router::new()
        .route("/health", get(admin::health))
        .route("/api/v1/rate-limits/check", post(admin::check))
        .nest("/api/v1/admin/rate-limits", admin_api)
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ratelimit::{
        ManualClock, MemoryWindowStore, RateLimitRule, UnavailableStore, WindowStore,
    };
    use crate::store::{MemoryRuleStore, RuleStore};

    pub struct TestApp {
        pub state: AppState,
        pub rules: Arc<MemoryRuleStore>,
        pub clock: ManualClock,
    }

    impl TestApp {
        pub fn new() -> Self {
            Self::with_windows(Arc::new(MemoryWindowStore::new()))
        }

        pub fn unavailable() -> Self {
            Self::with_windows(Arc::new(UnavailableStore))
        }

        fn with_windows(windows: Arc<dyn WindowStore>) -> Self {
            let rules = Arc::new(MemoryRuleStore::new());
            let clock = ManualClock::new(1_700_000_000_000);
            let config = RateLimitingConfig::default();
            let limiter = RateLimiterService::new(
                windows,
                rules.clone(),
                Arc::new(clock.clone()),
                "rate_limit",
                &config,
            );
            Self {
                state: AppState::new(Arc::new(limiter), config),
                rules,
                clock,
            }
        }

        pub async fn add_rule(&self, rule: RateLimitRule) {
            self.rules.insert_rule(rule).await.unwrap();
            self.state.limiter.resolver().invalidate_all();
        }

        pub fn router(&self) -> Router {
            router(self.state.clone())
        }
    }
}
