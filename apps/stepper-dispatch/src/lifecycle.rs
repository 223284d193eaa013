use std::sync::Arc;

use stepper_sdk::models::{
    AvailabilityHistoryRecord, DriverStatus, TripRecord, TripStatus, TriggerSource,
};
use stepper_sdk::store::{AssignOutcome, DispatchStore};
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::status::StatusBroadcaster;

pub const REASON_TRIP_ASSIGNED: &str = "trip assigned";
pub const REASON_TRIP_STARTED: &str = "trip started";
pub const REASON_TRIP_COMPLETED: &str = "trip completed";
pub const REASON_TRIP_CANCELLED: &str = "trip cancelled";

/// Trip transitions after an offer goes out: acceptance, start, completion,
/// cancellation. Each applied transition is announced on the trip's streams.
#[derive(Clone)]
pub struct TripLifecycle {
    store: Arc<dyn DispatchStore>,
    status: StatusBroadcaster,
}

/// Whether `from -> to` is a transition callers may request directly.
/// PUBLISHED -> OFFERED and OFFERED -> ASSIGNED go through the broadcaster
/// and `accept_offer` instead.
pub fn is_allowed_transition(from: TripStatus, to: TripStatus) -> bool {
    match (from, to) {
        (TripStatus::Assigned, TripStatus::InProgress) => true,
        (TripStatus::InProgress, TripStatus::Completed) => true,
        (from, TripStatus::Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

impl TripLifecycle {
    pub fn new(store: Arc<dyn DispatchStore>, status: StatusBroadcaster) -> Self {
        Self { store, status }
    }

    pub async fn accept_offer(
        &self,
        trip_id: &str,
        driver_id: &str,
    ) -> Result<TripRecord, DispatchError> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or(DispatchError::TripNotFound)?;
        if trip.driver_id.is_some() {
            return Err(DispatchError::DriverAlreadyAssigned);
        }
        if trip.status != TripStatus::Offered {
            return Err(DispatchError::InvalidStatus {
                expected: TripStatus::Offered,
                actual: trip.status,
            });
        }
        let driver = self
            .store
            .get_driver(driver_id)
            .await?
            .ok_or(DispatchError::DriverNotFound)?;
        if driver.status != DriverStatus::Available {
            return Err(DispatchError::DriverUnavailable);
        }

        let history = AvailabilityHistoryRecord::new(
            driver_id,
            DriverStatus::Available,
            DriverStatus::Busy,
            REASON_TRIP_ASSIGNED,
            TriggerSource::Trip,
        )
        .with_trip(trip_id);
        let assigned = match self.store.assign_trip(trip_id, history).await? {
            AssignOutcome::Assigned(trip) => trip,
            AssignOutcome::TripNotOpen => return Err(DispatchError::OfferClosed),
            AssignOutcome::DriverUnavailable => return Err(DispatchError::DriverUnavailable),
        };

        info!(trip_id, driver_id, "trip offer accepted");
        self.status.publish_status_change(
            &assigned,
            TripStatus::Offered,
            TripStatus::Assigned,
            Some(driver.name),
            None,
        );
        Ok(assigned)
    }

    pub async fn update_trip_status(
        &self,
        trip_id: &str,
        new_status: TripStatus,
        notes: Option<String>,
    ) -> Result<TripRecord, DispatchError> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or(DispatchError::TripNotFound)?;
        let previous = trip.status;
        if !is_allowed_transition(previous, new_status) {
            return Err(DispatchError::InvalidTransition {
                from: previous,
                to: new_status,
            });
        }
        let updated = self
            .store
            .transition_trip(trip_id, previous, new_status)
            .await?
            .ok_or(DispatchError::InvalidTransition {
                from: previous,
                to: new_status,
            })?;

        let driver_name = match updated.driver_id.as_deref() {
            Some(driver_id) => self.move_driver(&updated, driver_id).await,
            None => None,
        };

        info!(trip_id, from = %previous, to = %new_status, "trip status updated");
        self.status
            .publish_status_change(&updated, previous, new_status, driver_name, notes);
        Ok(updated)
    }

    /// Follow a trip transition with the assigned driver's availability.
    /// The trip has already moved, so a driver that cannot follow is logged and
    /// left for maintenance to reclaim. Returns the driver's name for the event.
    async fn move_driver(&self, trip: &TripRecord, driver_id: &str) -> Option<String> {
        let driver = match self.store.get_driver(driver_id).await {
            Ok(Some(driver)) => driver,
            Ok(None) => {
                warn!(trip_id = %trip.id, driver_id, "assigned driver no longer exists");
                return None;
            }
            Err(err) => {
                warn!(trip_id = %trip.id, driver_id, error = %err, "failed to load assigned driver");
                return None;
            }
        };

        let step = match trip.status {
            TripStatus::InProgress => Some((DriverStatus::OnTrip, REASON_TRIP_STARTED)),
            TripStatus::Completed => Some((DriverStatus::Available, REASON_TRIP_COMPLETED)),
            TripStatus::Cancelled => Some((DriverStatus::Available, REASON_TRIP_CANCELLED)),
            _ => None,
        };
        let Some((target, reason)) = step else {
            return Some(driver.name);
        };
        if !DriverStatus::TRANSITIONAL.contains(&driver.status) || driver.status == target {
            return Some(driver.name);
        }

        let history =
            AvailabilityHistoryRecord::new(driver_id, driver.status, target, reason, TriggerSource::Trip)
                .with_trip(&trip.id);
        match self.store.transition_driver(history).await {
            Ok(true) => {}
            Ok(false) => warn!(
                trip_id = %trip.id,
                driver_id,
                "driver status changed concurrently; not following trip"
            ),
            Err(err) => warn!(
                trip_id = %trip.id,
                driver_id,
                error = %err,
                "failed to update driver for trip transition"
            ),
        }
        Some(driver.name)
    }
}
