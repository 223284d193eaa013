//! Store wrappers shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stepper_sdk::models::{
    AvailabilityHistoryRecord, DriverRecord, DriverStatus, NotificationRecord, ScheduleRecord,
    TripOfferRecord, TripRecord, TripStatus,
};
use stepper_sdk::store::{
    AssignOutcome, DispatchStore, InMemoryDispatchStore, ScheduleClosed, StoreError,
};

/// Delegates to the in-memory store but fails every driver write for one driver.
pub(crate) struct FailingDriverStore {
    pub inner: Arc<InMemoryDispatchStore>,
    pub poisoned: &'static str,
}

#[async_trait]
impl DispatchStore for FailingDriverStore {
    async fn upsert_trip(&self, trip: TripRecord) -> Result<(), StoreError> {
        self.inner.upsert_trip(trip).await
    }
    async fn get_trip(&self, trip_id: &str) -> Result<Option<TripRecord>, StoreError> {
        self.inner.get_trip(trip_id).await
    }
    async fn mark_trip_offered(&self, offer: TripOfferRecord) -> Result<bool, StoreError> {
        self.inner.mark_trip_offered(offer).await
    }
    async fn get_offer(&self, trip_id: &str) -> Result<Option<TripOfferRecord>, StoreError> {
        self.inner.get_offer(trip_id).await
    }
    async fn expired_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TripOfferRecord>, StoreError> {
        self.inner.expired_offers(now).await
    }
    async fn expire_offer(
        &self,
        trip_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TripRecord>, StoreError> {
        self.inner.expire_offer(trip_id, now).await
    }
    async fn assign_trip(
        &self,
        trip_id: &str,
        history: AvailabilityHistoryRecord,
    ) -> Result<AssignOutcome, StoreError> {
        self.inner.assign_trip(trip_id, history).await
    }
    async fn transition_trip(
        &self,
        trip_id: &str,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError> {
        self.inner.transition_trip(trip_id, from, to).await
    }
    async fn upsert_driver(&self, driver: DriverRecord) -> Result<(), StoreError> {
        self.inner.upsert_driver(driver).await
    }
    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverRecord>, StoreError> {
        self.inner.get_driver(driver_id).await
    }
    async fn drivers_with_status(
        &self,
        status: DriverStatus,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        self.inner.drivers_with_status(status).await
    }
    async fn stale_drivers(
        &self,
        statuses: &[DriverStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        self.inner.stale_drivers(statuses, cutoff).await
    }
    async fn transition_driver(
        &self,
        history: AvailabilityHistoryRecord,
    ) -> Result<bool, StoreError> {
        if history.driver_id == self.poisoned {
            return Err(StoreError::Store("connection reset".into()));
        }
        self.inner.transition_driver(history).await
    }
    async fn history_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<AvailabilityHistoryRecord>, StoreError> {
        self.inner.history_for_driver(driver_id).await
    }
    async fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError> {
        self.inner.insert_schedule(schedule).await
    }
    async fn get_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleRecord>, StoreError> {
        self.inner.get_schedule(schedule_id).await
    }
    async fn ended_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        self.inner.ended_schedules(now).await
    }
    async fn schedules_in_force(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        self.inner.schedules_in_force(now).await
    }
    async fn close_schedule(
        &self,
        schedule_id: &str,
        release: Option<AvailabilityHistoryRecord>,
    ) -> Result<ScheduleClosed, StoreError> {
        if release.as_ref().is_some_and(|h| h.driver_id == self.poisoned) {
            return Err(StoreError::Store("connection reset".into()));
        }
        self.inner.close_schedule(schedule_id, release).await
    }
    async fn create_notification(
        &self,
        notification: NotificationRecord,
    ) -> Result<(), StoreError> {
        self.inner.create_notification(notification).await
    }
    async fn notifications_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.inner.notifications_for_driver(driver_id).await
    }
}
