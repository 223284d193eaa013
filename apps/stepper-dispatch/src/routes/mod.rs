mod auth;
mod cron;
mod drivers;
mod streams;
mod trips;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::DispatchError;
use crate::metrics;
use crate::state::AppState;

pub use auth::BearerToken;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route("/trips/:trip_id/broadcast-offer", post(trips::broadcast_offer))
        .route("/trips/:trip_id/accept", post(trips::accept_offer))
        .route("/trips/:trip_id/status", post(trips::update_status))
        .route("/trips/:trip_id/events", get(streams::trip_events))
        .route("/drivers/:driver_id/offers", get(streams::driver_offers))
        .route("/drivers/:driver_id/schedules", post(drivers::create_schedule))
        .route(
            "/drivers/:driver_id/schedules/:schedule_id",
            delete(drivers::cancel_schedule),
        )
        .route("/drivers/:driver_id/history", get(drivers::history))
        .route(
            "/cron/availability",
            get(cron::run_availability).post(cron::run_availability),
        )
        .route("/debug/connections", get(debug_connections))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    open_connections: usize,
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        instance_id: state.instance_id().to_string(),
        open_connections: state.trip_streams().connection_count(None)
            + state.driver_streams().connection_count(None),
    })
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsResponse {
    instance_id: String,
    active_trip_ids: Vec<String>,
    trip_connections: usize,
    driver_connections: usize,
}

async fn debug_connections(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        instance_id: state.instance_id().to_string(),
        active_trip_ids: state.active_trip_ids(),
        trip_connections: state.trip_streams().connection_count(None),
        driver_connections: state.driver_streams().connection_count(None),
    })
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(&'static str),
    Conflict(String),
    BadRequest(String),
    /// The deployment is missing configuration the request depends on.
    Misconfigured(&'static str),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found",
                Some(format!("{what} not found")),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Misconfigured(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "misconfigured",
                Some(msg.to_string()),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                Some("internal error".to_string()),
            ),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::TripNotFound => ApiError::NotFound("trip"),
            DispatchError::DriverNotFound => ApiError::NotFound("driver"),
            DispatchError::ScheduleNotFound => ApiError::NotFound("schedule"),
            DispatchError::DriverAlreadyAssigned
            | DispatchError::DriverUnavailable
            | DispatchError::OfferClosed => ApiError::Conflict(err.to_string()),
            DispatchError::InvalidStatus { .. }
            | DispatchError::InvalidTransition { .. }
            | DispatchError::InvalidSchedule(_) => ApiError::BadRequest(err.to_string()),
            DispatchError::Store(store_err) => {
                error!(error = %store_err, "store operation failed");
                ApiError::Internal
            }
        }
    }
}
