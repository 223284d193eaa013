use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use stepper_sdk::models::{TripRecord, TripStatus};
use stepper_sdk::BroadcastOfferResponse;

use crate::state::AppState;

use super::{ApiError, ApiResult};

pub async fn broadcast_offer(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> ApiResult<BroadcastOfferResponse> {
    let outcome = state.offers().broadcast_trip_offer(&trip_id).await?;
    Ok(Json(BroadcastOfferResponse {
        success: true,
        trip_id: outcome.trip.id,
        trip_title: outcome.trip.title,
        drivers_notified: outcome.sent,
        eligible_drivers: outcome.eligible,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOfferRequest {
    driver_id: String,
}

pub async fn accept_offer(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Json(body): Json<AcceptOfferRequest>,
) -> ApiResult<TripRecord> {
    let trip = state
        .lifecycle()
        .accept_offer(&trip_id, &body.driver_id)
        .await?;
    Ok(Json(trip))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    status: String,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<TripRecord> {
    let status: TripStatus = body
        .status
        .trim()
        .to_ascii_uppercase()
        .parse()
        .map_err(|err: stepper_sdk::models::UnknownVariant| ApiError::BadRequest(err.to_string()))?;
    let trip = state
        .lifecycle()
        .update_trip_status(&trip_id, status, body.notes)
        .await?;
    Ok(Json(trip))
}
