use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_core::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::DispatchError;
use crate::registry::Subscription;
use crate::state::AppState;

use super::ApiError;

/// Status changes for one trip, one `data:` frame per event.
pub async fn trip_events(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state
        .store()
        .get_trip(&trip_id)
        .await
        .map_err(DispatchError::from)?
        .ok_or(ApiError::NotFound("trip"))?;
    let subscription = state.trip_streams().subscribe(&trip_id);
    debug!(trip_id = %trip_id, handle_id = subscription.handle_id(), "trip stream opened");
    Ok(sse(subscription))
}

/// Trip offers sent to one driver.
pub async fn driver_offers(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state
        .store()
        .get_driver(&driver_id)
        .await
        .map_err(DispatchError::from)?
        .ok_or(ApiError::NotFound("driver"))?;
    let subscription = state.driver_streams().subscribe(&driver_id);
    debug!(driver_id = %driver_id, handle_id = subscription.handle_id(), "offer stream opened");
    Ok(sse(subscription))
}

// Dropping the response body drops the subscription, which deregisters it.
fn sse(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = subscription.map(|frame| Ok(Event::default().data(&*frame)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
