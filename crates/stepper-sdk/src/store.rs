use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{
    AvailabilityHistoryRecord, DriverRecord, DriverStatus, NotificationRecord, OfferStatus,
    ScheduleRecord, TripOfferRecord, TripRecord, TripStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Store(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result of an attempt to hand an offered trip to a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    Assigned(TripRecord),
    /// The trip is missing, no longer OFFERED, or already has a driver.
    TripNotOpen,
    /// The driver is missing or not in the status the assignment expected.
    DriverUnavailable,
}

/// Result of closing an availability schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleClosed {
    /// The schedule was missing or already inactive; nothing was written.
    AlreadyClosed,
    Closed { driver_released: bool },
}

/// Persistence seam for the dispatch core.
///
/// Every mutating call that names an expected state is a conditional update:
/// it only applies when the record is still in that state and reports whether
/// it did. Callers never read-modify-write.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn upsert_trip(&self, trip: TripRecord) -> Result<(), StoreError>;

    async fn get_trip(&self, trip_id: &str) -> Result<Option<TripRecord>, StoreError>;

    /// Store `offer` and move its trip PUBLISHED -> OFFERED in one step, provided the
    /// trip is still PUBLISHED and driverless.
    async fn mark_trip_offered(&self, offer: TripOfferRecord) -> Result<bool, StoreError>;

    async fn get_offer(&self, trip_id: &str) -> Result<Option<TripOfferRecord>, StoreError>;

    /// Offers still OFFERED whose deadline is at or before `now`.
    async fn expired_offers(&self, now: DateTime<Utc>)
        -> Result<Vec<TripOfferRecord>, StoreError>;

    /// Mark an open offer EXPIRED. Its trip goes back to PUBLISHED and is returned only
    /// when it is still OFFERED and driverless; an offer whose trip moved on some other
    /// way (cancelled, say) is closed without touching the trip.
    async fn expire_offer(
        &self,
        trip_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TripRecord>, StoreError>;

    /// Give an OFFERED trip to a driver. `history` describes the driver transition and
    /// its `previous_status` is the status the driver must currently hold.
    async fn assign_trip(
        &self,
        trip_id: &str,
        history: AvailabilityHistoryRecord,
    ) -> Result<AssignOutcome, StoreError>;

    /// Conditional trip status change. Returns the updated record when applied.
    async fn transition_trip(
        &self,
        trip_id: &str,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError>;

    async fn upsert_driver(&self, driver: DriverRecord) -> Result<(), StoreError>;

    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverRecord>, StoreError>;

    async fn drivers_with_status(
        &self,
        status: DriverStatus,
    ) -> Result<Vec<DriverRecord>, StoreError>;

    /// Drivers holding one of `statuses` whose last activity is older than `cutoff`.
    async fn stale_drivers(
        &self,
        statuses: &[DriverStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DriverRecord>, StoreError>;

    /// Apply `history.previous_status -> history.new_status` to the driver and append
    /// `history`, only if the driver still holds `previous_status`.
    async fn transition_driver(
        &self,
        history: AvailabilityHistoryRecord,
    ) -> Result<bool, StoreError>;

    async fn history_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<AvailabilityHistoryRecord>, StoreError>;

    async fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError>;

    async fn get_schedule(&self, schedule_id: &str)
        -> Result<Option<ScheduleRecord>, StoreError>;

    /// Active schedules whose window closed at or before `now`.
    async fn ended_schedules(&self, now: DateTime<Utc>)
        -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Active schedules whose window contains `now`.
    async fn schedules_in_force(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Soft-delete an active schedule and, in the same step, apply `release` when the
    /// driver still holds `release.previous_status`. Either both are written or neither.
    async fn close_schedule(
        &self,
        schedule_id: &str,
        release: Option<AvailabilityHistoryRecord>,
    ) -> Result<ScheduleClosed, StoreError>;

    async fn create_notification(&self, notification: NotificationRecord)
        -> Result<(), StoreError>;

    async fn notifications_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<NotificationRecord>, StoreError>;
}

#[derive(Default)]
struct Tables {
    trips: BTreeMap<String, TripRecord>,
    offers: BTreeMap<String, TripOfferRecord>,
    drivers: BTreeMap<String, DriverRecord>,
    schedules: BTreeMap<String, ScheduleRecord>,
    history: Vec<AvailabilityHistoryRecord>,
    notifications: Vec<NotificationRecord>,
}

impl Tables {
    fn apply_driver_transition(&mut self, history: &AvailabilityHistoryRecord) -> bool {
        let Some(driver) = self.drivers.get_mut(&history.driver_id) else {
            return false;
        };
        if driver.status != history.previous_status {
            return false;
        }
        driver.status = history.new_status;
        driver.last_active_at = history.created_at;
        self.history.push(history.clone());
        true
    }
}

/// In-memory adapter for tests and database-less deployments. A single lock
/// guards every table so multi-record operations are atomic.
#[derive(Default)]
pub struct InMemoryDispatchStore {
    tables: Mutex<Tables>,
}

impl InMemoryDispatchStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DispatchStore for InMemoryDispatchStore {
    async fn upsert_trip(&self, trip: TripRecord) -> Result<(), StoreError> {
        self.tables.lock().await.trips.insert(trip.id.clone(), trip);
        Ok(())
    }

    async fn get_trip(&self, trip_id: &str) -> Result<Option<TripRecord>, StoreError> {
        Ok(self.tables.lock().await.trips.get(trip_id).cloned())
    }

    async fn mark_trip_offered(&self, offer: TripOfferRecord) -> Result<bool, StoreError> {
        let mut guard = self.tables.lock().await;
        let Some(trip) = guard.trips.get_mut(&offer.trip_id) else {
            return Ok(false);
        };
        if trip.status != TripStatus::Published || trip.driver_id.is_some() {
            return Ok(false);
        }
        trip.status = TripStatus::Offered;
        trip.updated_at = offer.offered_at;
        guard.offers.insert(offer.trip_id.clone(), offer);
        Ok(true)
    }

    async fn get_offer(&self, trip_id: &str) -> Result<Option<TripOfferRecord>, StoreError> {
        Ok(self.tables.lock().await.offers.get(trip_id).cloned())
    }

    async fn expired_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TripOfferRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .offers
            .values()
            .filter(|o| o.status == OfferStatus::Offered && o.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn expire_offer(
        &self,
        trip_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TripRecord>, StoreError> {
        let mut guard = self.tables.lock().await;
        let open = guard
            .offers
            .get(trip_id)
            .is_some_and(|o| o.status == OfferStatus::Offered);
        if !open {
            return Ok(None);
        }
        let reopen = guard
            .trips
            .get(trip_id)
            .is_some_and(|t| t.status == TripStatus::Offered && t.driver_id.is_none());
        if let Some(offer) = guard.offers.get_mut(trip_id) {
            offer.status = OfferStatus::Expired;
        }
        if !reopen {
            return Ok(None);
        }
        let Some(trip) = guard.trips.get_mut(trip_id) else {
            return Ok(None);
        };
        trip.status = TripStatus::Published;
        trip.updated_at = now;
        Ok(Some(trip.clone()))
    }

    async fn assign_trip(
        &self,
        trip_id: &str,
        history: AvailabilityHistoryRecord,
    ) -> Result<AssignOutcome, StoreError> {
        let mut guard = self.tables.lock().await;
        let trip_open = guard
            .trips
            .get(trip_id)
            .is_some_and(|t| t.status == TripStatus::Offered && t.driver_id.is_none());
        if !trip_open {
            return Ok(AssignOutcome::TripNotOpen);
        }
        if !guard.apply_driver_transition(&history) {
            return Ok(AssignOutcome::DriverUnavailable);
        }
        if let Some(offer) = guard.offers.get_mut(trip_id) {
            offer.status = OfferStatus::Assigned;
        }
        let Some(trip) = guard.trips.get_mut(trip_id) else {
            return Ok(AssignOutcome::TripNotOpen);
        };
        trip.status = TripStatus::Assigned;
        trip.driver_id = Some(history.driver_id.clone());
        trip.updated_at = history.created_at;
        Ok(AssignOutcome::Assigned(trip.clone()))
    }

    async fn transition_trip(
        &self,
        trip_id: &str,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError> {
        let mut guard = self.tables.lock().await;
        match guard.trips.get_mut(trip_id) {
            Some(trip) if trip.status == from => {
                trip.status = to;
                trip.updated_at = Utc::now();
                Ok(Some(trip.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn upsert_driver(&self, driver: DriverRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .drivers
            .insert(driver.id.clone(), driver);
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverRecord>, StoreError> {
        Ok(self.tables.lock().await.drivers.get(driver_id).cloned())
    }

    async fn drivers_with_status(
        &self,
        status: DriverStatus,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .drivers
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect())
    }

    async fn stale_drivers(
        &self,
        statuses: &[DriverStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .drivers
            .values()
            .filter(|d| statuses.contains(&d.status) && d.last_active_at < cutoff)
            .cloned()
            .collect())
    }

    async fn transition_driver(
        &self,
        history: AvailabilityHistoryRecord,
    ) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.apply_driver_transition(&history))
    }

    async fn history_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<AvailabilityHistoryRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.driver_id == driver_id)
            .cloned()
            .collect())
    }

    async fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .schedules
            .insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn get_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleRecord>, StoreError> {
        Ok(self.tables.lock().await.schedules.get(schedule_id).cloned())
    }

    async fn ended_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .schedules
            .values()
            .filter(|s| s.is_active && s.ends_at <= now)
            .cloned()
            .collect())
    }

    async fn schedules_in_force(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .schedules
            .values()
            .filter(|s| s.in_force_at(now))
            .cloned()
            .collect())
    }

    async fn close_schedule(
        &self,
        schedule_id: &str,
        release: Option<AvailabilityHistoryRecord>,
    ) -> Result<ScheduleClosed, StoreError> {
        let mut guard = self.tables.lock().await;
        match guard.schedules.get_mut(schedule_id) {
            Some(schedule) if schedule.is_active => schedule.is_active = false,
            _ => return Ok(ScheduleClosed::AlreadyClosed),
        }
        let driver_released = release
            .as_ref()
            .is_some_and(|history| guard.apply_driver_transition(history));
        Ok(ScheduleClosed::Closed { driver_released })
    }

    async fn create_notification(
        &self,
        notification: NotificationRecord,
    ) -> Result<(), StoreError> {
        self.tables.lock().await.notifications.push(notification);
        Ok(())
    }

    async fn notifications_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.driver_id == driver_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerSource;

    fn driver(id: &str, status: DriverStatus) -> DriverRecord {
        DriverRecord {
            id: id.into(),
            name: format!("Driver {id}"),
            status,
            vehicle_type: None,
            location: None,
            last_active_at: Utc::now(),
        }
    }

    fn published_trip(id: &str) -> TripRecord {
        TripRecord {
            id: id.into(),
            title: "Almaty to Shymbulak".into(),
            status: TripStatus::Published,
            driver_id: None,
            origin_name: "Almaty".into(),
            dest_name: "Shymbulak".into(),
            origin: None,
            vehicle_type: None,
            updated_at: Utc::now(),
        }
    }

    fn offer(trip_id: &str) -> TripOfferRecord {
        let now = Utc::now();
        TripOfferRecord {
            trip_id: trip_id.into(),
            status: OfferStatus::Offered,
            eligible_count: 1,
            sent_count: 1,
            offered_at: now,
            expires_at: now + chrono::Duration::seconds(300),
        }
    }

    #[tokio::test]
    async fn driver_transition_is_conditional() {
        let store = InMemoryDispatchStore::new();
        store.upsert_driver(driver("d1", DriverStatus::OnTrip)).await.unwrap();

        let stale = AvailabilityHistoryRecord::new(
            "d1",
            DriverStatus::Busy,
            DriverStatus::Available,
            "stale state reclaimed",
            TriggerSource::System,
        );
        assert!(!store.transition_driver(stale).await.unwrap());

        let reclaim = AvailabilityHistoryRecord::new(
            "d1",
            DriverStatus::OnTrip,
            DriverStatus::Available,
            "stale state reclaimed",
            TriggerSource::System,
        );
        assert!(store.transition_driver(reclaim.clone()).await.unwrap());
        assert!(!store.transition_driver(reclaim).await.unwrap());

        let history = store.history_for_driver("d1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            store.get_driver("d1").await.unwrap().unwrap().status,
            DriverStatus::Available
        );
    }

    #[tokio::test]
    async fn marking_offered_requires_published_driverless_trip() {
        let store = InMemoryDispatchStore::new();
        store.upsert_trip(published_trip("t1")).await.unwrap();
        let mut taken = published_trip("t2");
        taken.driver_id = Some("d9".into());
        store.upsert_trip(taken).await.unwrap();

        assert!(store.mark_trip_offered(offer("t1")).await.unwrap());
        assert!(!store.mark_trip_offered(offer("t1")).await.unwrap());
        assert!(!store.mark_trip_offered(offer("t2")).await.unwrap());
        assert!(!store.mark_trip_offered(offer("missing")).await.unwrap());

        assert_eq!(
            store.get_trip("t1").await.unwrap().unwrap().status,
            TripStatus::Offered
        );
        assert!(store.get_offer("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assign_checks_trip_before_driver() {
        let store = InMemoryDispatchStore::new();
        store.upsert_trip(published_trip("t1")).await.unwrap();
        store.upsert_driver(driver("d1", DriverStatus::Available)).await.unwrap();
        let history = AvailabilityHistoryRecord::new(
            "d1",
            DriverStatus::Available,
            DriverStatus::Busy,
            "trip assigned",
            TriggerSource::Trip,
        );

        let outcome = store.assign_trip("t1", history.clone()).await.unwrap();
        assert_eq!(outcome, AssignOutcome::TripNotOpen);
        assert!(store.history_for_driver("d1").await.unwrap().is_empty());

        store.mark_trip_offered(offer("t1")).await.unwrap();
        match store.assign_trip("t1", history).await.unwrap() {
            AssignOutcome::Assigned(trip) => {
                assert_eq!(trip.status, TripStatus::Assigned);
                assert_eq!(trip.driver_id.as_deref(), Some("d1"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            store.get_offer("t1").await.unwrap().unwrap().status,
            OfferStatus::Assigned
        );
    }

    #[tokio::test]
    async fn closing_schedule_releases_driver_once() {
        let store = InMemoryDispatchStore::new();
        let now = Utc::now();
        store
            .upsert_driver(driver("d1", DriverStatus::Offline))
            .await
            .unwrap();
        store
            .insert_schedule(ScheduleRecord {
                id: "s1".into(),
                driver_id: "d1".into(),
                starts_at: now - chrono::Duration::hours(2),
                ends_at: now - chrono::Duration::hours(1),
                schedule_type: crate::models::ScheduleType::Offline,
                is_active: true,
                notes: None,
            })
            .await
            .unwrap();
        let release = || {
            AvailabilityHistoryRecord::new(
                "d1",
                DriverStatus::Offline,
                DriverStatus::Available,
                "schedule ended",
                TriggerSource::System,
            )
            .with_schedule("s1")
        };
        assert_eq!(store.ended_schedules(now).await.unwrap().len(), 1);
        assert_eq!(
            store.close_schedule("s1", Some(release())).await.unwrap(),
            ScheduleClosed::Closed {
                driver_released: true
            }
        );
        assert_eq!(
            store.close_schedule("s1", Some(release())).await.unwrap(),
            ScheduleClosed::AlreadyClosed
        );
        assert!(store.ended_schedules(now).await.unwrap().is_empty());
        assert_eq!(store.history_for_driver("d1").await.unwrap().len(), 1);
        assert_eq!(
            store.get_driver("d1").await.unwrap().unwrap().status,
            DriverStatus::Available
        );
    }

    #[tokio::test]
    async fn expiring_offer_of_cancelled_trip_closes_it_only() {
        let store = InMemoryDispatchStore::new();
        store.upsert_trip(published_trip("t1")).await.unwrap();
        store.mark_trip_offered(offer("t1")).await.unwrap();
        store
            .transition_trip("t1", TripStatus::Offered, TripStatus::Cancelled)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.expired_offers(later).await.unwrap().len(), 1);
        assert!(store.expire_offer("t1", later).await.unwrap().is_none());
        assert!(store.expired_offers(later).await.unwrap().is_empty());
        assert_eq!(
            store.get_trip("t1").await.unwrap().unwrap().status,
            TripStatus::Cancelled
        );
    }
}
