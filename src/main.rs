use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tenant_limiter::config::{LimiterConfig, LogFormat};
use tenant_limiter::error::LimiterError;
use tenant_limiter::http::{AppState, HttpServer};
use tenant_limiter::ratelimit::{
    spawn_flusher, Clock, MemoryWindowStore, RateLimiterService, RedisWindowStore, RuleSet,
    SystemClock, WindowStore,
};
use tenant_limiter::store::{MemoryRuleStore, PgRuleStore, RuleStore};

/// Tenant-aware rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tenant-limiter", version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn init_tracing(config: &LimiterConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

async fn window_store(config: &LimiterConfig) -> anyhow::Result<Arc<dyn WindowStore>> {
    match &config.redis.url {
        Some(url) => {
            let store = RedisWindowStore::connect(url)
                .await
                .context("failed to connect to Redis")?;
            info!("Using Redis window store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No Redis URL configured, counters are local to this instance");
            Ok(Arc::new(MemoryWindowStore::new()))
        }
    }
}

async fn rule_store(config: &LimiterConfig) -> anyhow::Result<Arc<dyn RuleStore>> {
    let seed = match &config.database.rules_path {
        Some(path) => Some(RuleSet::from_file(path).context("failed to load rules file")?),
        None => None,
    };

    let Some(url) = &config.database.url else {
        info!("Using in-memory rule store");
        return Ok(Arc::new(seed.map_or_else(
            MemoryRuleStore::new,
            MemoryRuleStore::with_rules,
        )));
    };

    let store = PgRuleStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.migrate().await.context("failed to apply schema")?;

    let seed = seed.unwrap_or_default();
    for rule in seed.rules {
        match store.insert_rule(rule).await {
            Ok(rule) => info!(rule_id = %rule.id, "Seeded rate limit rule"),
            Err(LimiterError::Conflict(_)) => {}
            Err(e) => return Err(e).context("failed to seed rules"),
        }
    }
    for profile in seed.tenants {
        let profile = store
            .upsert_tenant_profile(profile)
            .await
            .context("failed to seed tenant profiles")?;
        info!(tenant_id = %profile.tenant_id, plan = %profile.plan, "Seeded tenant profile");
    }

    info!("Using PostgreSQL rule store");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LimiterConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Tenant Limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let windows = window_store(&config).await?;
    let rules = rule_store(&config).await?;

    let limiter = Arc::new(RateLimiterService::new(
        windows,
        Arc::clone(&rules),
        Arc::clone(&clock),
        &config.redis.key_prefix,
        &config.rate_limiting,
    ));
    info!("Rate limiter initialized");

    let (stop_flusher, flusher_shutdown) = watch::channel(false);
    let flusher = spawn_flusher(
        Arc::clone(limiter.metrics()),
        Arc::clone(&rules),
        Arc::clone(&clock),
        config.rate_limiting.metrics_flush_interval(),
        flusher_shutdown,
    );

    let state = AppState::new(Arc::clone(&limiter), config.rate_limiting.clone());
    let server = HttpServer::new(config.server.listen_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    let _ = stop_flusher.send(true);
    if let Err(e) = flusher.await {
        warn!(error = %e, "Metrics flusher task failed");
    }
    if let Err(e) = limiter
        .metrics()
        .flush(rules.as_ref(), clock.now_ms(), true)
        .await
    {
        warn!(error = %e, "Failed to flush metrics on shutdown");
    }

    info!("Tenant Limiter stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
