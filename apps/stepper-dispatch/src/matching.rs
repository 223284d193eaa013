use std::sync::Arc;

use async_trait::async_trait;
use stepper_sdk::models::{DriverRecord, DriverStatus, TripRecord};
use stepper_sdk::store::{DispatchStore, StoreError};

/// Decides which drivers may be offered a trip.
#[async_trait]
pub trait DriverMatcher: Send + Sync {
    async fn eligible_drivers(&self, trip: &TripRecord) -> Result<Vec<DriverRecord>, StoreError>;
}

/// Available drivers with the trip's vehicle type (when it names one) within
/// `radius_km` of the trip origin (when both positions are known).
pub struct AvailabilityMatcher {
    store: Arc<dyn DispatchStore>,
    radius_km: f64,
}

impl AvailabilityMatcher {
    pub fn new(store: Arc<dyn DispatchStore>, radius_km: f64) -> Self {
        Self { store, radius_km }
    }

    fn accepts(&self, trip: &TripRecord, driver: &DriverRecord) -> bool {
        if let Some(required) = trip.vehicle_type.as_deref() {
            let matches = driver
                .vehicle_type
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(required));
            if !matches {
                return false;
            }
        }
        match (trip.origin.as_ref(), driver.location.as_ref()) {
            (Some(origin), Some(location)) => origin.distance_km(location) <= self.radius_km,
            _ => true,
        }
    }
}

#[async_trait]
impl DriverMatcher for AvailabilityMatcher {
    async fn eligible_drivers(&self, trip: &TripRecord) -> Result<Vec<DriverRecord>, StoreError> {
        let candidates = self.store.drivers_with_status(DriverStatus::Available).await?;
        Ok(candidates
            .into_iter()
            .filter(|driver| self.accepts(trip, driver))
            .collect())
    }
}
