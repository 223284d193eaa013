use axum::{extract::State, Json};
use chrono::Utc;
use stepper_sdk::MaintenanceSummary;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::state::AppState;

use super::{ApiError, ApiResult, BearerToken};

/// Entry point for the external scheduler. Accepts GET and POST.
pub async fn run_availability(
    State(state): State<AppState>,
    token: Option<BearerToken>,
) -> ApiResult<MaintenanceSummary> {
    authorize_cron(state.config(), token.as_ref())?;
    let summary = state.maintenance().run_maintenance_tasks(Utc::now()).await;
    info!(
        errors = summary.errors.len(),
        noop = summary.is_noop(),
        "cron availability run served"
    );
    Ok(Json(summary))
}

fn authorize_cron(cfg: &AppConfig, token: Option<&BearerToken>) -> Result<(), ApiError> {
    match cfg.cron_secret.as_deref() {
        Some(secret) => match token {
            Some(token) if token.matches(secret) => Ok(()),
            _ => {
                warn!("rejected cron call with missing or wrong bearer token");
                Err(ApiError::Unauthorized)
            }
        },
        None if cfg.is_production() => Err(ApiError::Misconfigured(
            "CRON_SECRET must be set in production",
        )),
        None => {
            warn!(env = %cfg.app_env, "CRON_SECRET not set; running cron unauthenticated");
            Ok(())
        }
    }
}
