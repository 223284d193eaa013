use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use stepper_sdk::models::{AvailabilityHistoryRecord, ScheduleRecord, ScheduleType};

use crate::error::DispatchError;
use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    schedule_type: ScheduleType,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
    Json(body): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleRecord>), ApiError> {
    let schedule = state
        .schedules()
        .create_schedule(
            &driver_id,
            body.starts_at,
            body.ends_at,
            body.schedule_type,
            body.notes,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn cancel_schedule(
    State(state): State<AppState>,
    Path((driver_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<ScheduleRecord> {
    let schedule = state
        .schedules()
        .cancel_schedule(&driver_id, &schedule_id)
        .await?;
    Ok(Json(schedule))
}

pub async fn history(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> ApiResult<Vec<AvailabilityHistoryRecord>> {
    let store = state.store();
    if store
        .get_driver(&driver_id)
        .await
        .map_err(DispatchError::from)?
        .is_none()
    {
        return Err(ApiError::NotFound("driver"));
    }
    let records = store
        .history_for_driver(&driver_id)
        .await
        .map_err(DispatchError::from)?;
    Ok(Json(records))
}
