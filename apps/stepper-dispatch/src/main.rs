use anyhow::Context;
use axum::Router;
use stepper_dispatch::config::AppConfig;
use stepper_dispatch::metrics;
use stepper_dispatch::routes;
use stepper_dispatch::state::{build_store, AppState};
use stepper_dispatch::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("load configuration from environment")?;
    init_tracing(cfg.log_filter());

    let store = build_store(&cfg).await;
    let state = AppState::new(cfg.clone(), store);

    let _ticker = match cfg.maintenance_interval() {
        Some(every) => {
            info!(interval_secs = every.as_secs(), "in-process availability maintenance enabled");
            Some(state.maintenance().clone().spawn_ticker(every))
        }
        None => None,
    };
    if cfg.cron_secret.is_none() {
        warn!(env = %cfg.app_env, "CRON_SECRET is not set");
    }

    let app: Router = routes::build_router(state);
    let database = if cfg.database_url.is_some() {
        "configured"
    } else {
        "unset"
    };

    info!(
        addr = %cfg.bind_addr,
        instance = %cfg.instance_id,
        env = %cfg.app_env,
        database,
        offer_timeout_secs = cfg.offer_timeout_secs,
        stale_driver_secs = cfg.stale_driver_secs,
        match_radius_km = cfg.match_radius_km,
        build = env!("STEPPER_BUILD_ID"),
        "starting stepper-dispatch"
    );
    // Stream registries are per process; more than one replica needs sticky
    // routing by trip id.
    warn!("stream fan-out reaches only clients connected to this instance");
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server")?;
    info!("stepper-dispatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
