//! Trip offer fan-out to eligible drivers.
//!
//! A broadcast validates the trip, asks the matcher for eligible drivers,
//! notifies each one independently, and only then records the offer and moves
//! the trip PUBLISHED -> OFFERED in a single conditional store call. If the
//! process dies between delivery and that call the trip is still PUBLISHED and
//! can simply be broadcast again; offers that outlive their deadline are
//! returned to PUBLISHED by availability maintenance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use stepper_sdk::models::{
    DriverRecord, NotificationRecord, OfferStatus, TripOfferRecord, TripRecord, TripStatus,
    TRIP_OFFER_NOTIFICATION,
};
use stepper_sdk::store::{DispatchStore, StoreError};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::matching::DriverMatcher;
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::status::StatusBroadcaster;

/// Payload pushed to a driver's offer stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripOfferEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub trip_id: String,
    pub trip_title: String,
    pub origin_name: String,
    pub dest_name: String,
    pub expires_at: String,
}

impl TripOfferEvent {
    pub fn new(trip: &TripRecord, expires_at: DateTime<Utc>) -> Self {
        Self {
            kind: "trip_offer",
            trip_id: trip.id.clone(),
            trip_title: trip.title.clone(),
            origin_name: trip.origin_name.clone(),
            dest_name: trip.dest_name.clone(),
            expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Delivers one offer to one driver.
#[async_trait]
pub trait OfferNotifier: Send + Sync {
    async fn notify(&self, driver: &DriverRecord, offer: &TripOfferEvent)
        -> Result<(), DeliveryError>;
}

/// Persists a notification record, then pushes the offer to the driver's open
/// stream if there is one. Only the persisted record decides success.
pub struct StoreNotifier {
    store: Arc<dyn DispatchStore>,
    driver_streams: ConnectionRegistry,
}

impl StoreNotifier {
    pub fn new(store: Arc<dyn DispatchStore>, driver_streams: ConnectionRegistry) -> Self {
        Self {
            store,
            driver_streams,
        }
    }
}

#[async_trait]
impl OfferNotifier for StoreNotifier {
    async fn notify(
        &self,
        driver: &DriverRecord,
        offer: &TripOfferEvent,
    ) -> Result<(), DeliveryError> {
        self.store
            .create_notification(NotificationRecord {
                id: uuid::Uuid::new_v4().to_string(),
                driver_id: driver.id.clone(),
                trip_id: offer.trip_id.clone(),
                kind: TRIP_OFFER_NOTIFICATION.to_string(),
                title: "New trip offer".to_string(),
                body: format!(
                    "{}: {} to {}",
                    offer.trip_title, offer.origin_name, offer.dest_name
                ),
                created_at: Utc::now(),
            })
            .await?;
        let pushed = self.driver_streams.broadcast(&driver.id, offer);
        debug!(
            driver_id = %driver.id,
            trip_id = %offer.trip_id,
            streams = pushed.connections,
            "offer notification stored"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub driver_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct OfferOutcome {
    pub trip: TripRecord,
    pub sent: u32,
    pub eligible: u32,
    pub failures: Vec<DeliveryFailure>,
    /// Whether this call moved the trip to OFFERED.
    pub marked_offered: bool,
}

#[derive(Clone)]
pub struct TripOfferBroadcaster {
    store: Arc<dyn DispatchStore>,
    matcher: Arc<dyn DriverMatcher>,
    notifier: Arc<dyn OfferNotifier>,
    status: StatusBroadcaster,
    offer_timeout: chrono::Duration,
}

impl TripOfferBroadcaster {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        matcher: Arc<dyn DriverMatcher>,
        notifier: Arc<dyn OfferNotifier>,
        status: StatusBroadcaster,
        offer_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            matcher,
            notifier,
            status,
            offer_timeout,
        }
    }

    pub async fn broadcast_trip_offer(&self, trip_id: &str) -> Result<OfferOutcome, DispatchError> {
        let trip = match self.open_trip(trip_id).await {
            Ok(trip) => trip,
            Err(err) => {
                let label = match err {
                    DispatchError::Store(_) => "error",
                    _ => "rejected",
                };
                metrics::OFFER_BROADCASTS.with_label_values(&[label]).inc();
                return Err(err);
            }
        };

        let drivers = self.matcher.eligible_drivers(&trip).await?;
        let offered_at = Utc::now();
        let expires_at = offered_at + self.offer_timeout;
        let event = TripOfferEvent::new(&trip, expires_at);

        let results = join_all(
            drivers
                .iter()
                .map(|driver| self.notifier.notify(driver, &event)),
        )
        .await;

        let mut failures = Vec::new();
        for (driver, result) in drivers.iter().zip(results) {
            match result {
                Ok(()) => metrics::OFFER_DELIVERIES.with_label_values(&["ok"]).inc(),
                Err(err) => {
                    metrics::OFFER_DELIVERIES
                        .with_label_values(&["failed"])
                        .inc();
                    warn!(
                        trip_id = %trip.id,
                        driver_id = %driver.id,
                        error = %err,
                        "offer delivery failed"
                    );
                    failures.push(DeliveryFailure {
                        driver_id: driver.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        let eligible = drivers.len() as u32;
        let sent = eligible - failures.len() as u32;

        let mut marked_offered = false;
        let mut trip = trip;
        if sent > 0 {
            marked_offered = self
                .store
                .mark_trip_offered(TripOfferRecord {
                    trip_id: trip.id.clone(),
                    status: OfferStatus::Offered,
                    eligible_count: eligible,
                    sent_count: sent,
                    offered_at,
                    expires_at,
                })
                .await?;
            if marked_offered {
                trip.status = TripStatus::Offered;
                trip.updated_at = offered_at;
                self.status.publish_status_change(
                    &trip,
                    TripStatus::Published,
                    TripStatus::Offered,
                    None,
                    None,
                );
            } else {
                warn!(
                    trip_id = %trip.id,
                    "trip changed while offer was in flight; leaving status untouched"
                );
            }
        }

        let label = match (sent, failures.is_empty()) {
            (0, true) => "no_drivers",
            (0, false) => "failed",
            (_, true) => "sent",
            (_, false) => "partial",
        };
        metrics::OFFER_BROADCASTS.with_label_values(&[label]).inc();
        info!(
            trip_id = %trip.id,
            eligible,
            sent,
            failed = failures.len(),
            marked_offered,
            "trip offer broadcast"
        );

        Ok(OfferOutcome {
            trip,
            sent,
            eligible,
            failures,
            marked_offered,
        })
    }

    /// The trip, provided it exists, is PUBLISHED and has no driver.
    async fn open_trip(&self, trip_id: &str) -> Result<TripRecord, DispatchError> {
        let trip = self
            .store
            .get_trip(trip_id)
            .await?
            .ok_or(DispatchError::TripNotFound)?;
        if trip.driver_id.is_some() {
            return Err(DispatchError::DriverAlreadyAssigned);
        }
        if trip.status != TripStatus::Published {
            return Err(DispatchError::InvalidStatus {
                expected: TripStatus::Published,
                actual: trip.status,
            });
        }
        Ok(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use stepper_sdk::models::DriverStatus;
    use stepper_sdk::store::InMemoryDispatchStore;

    use crate::matching::AvailabilityMatcher;

    /// Wraps the store notifier and rejects a fixed set of drivers.
    struct FlakyNotifier {
        inner: StoreNotifier,
        failing: HashSet<String>,
        attempted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OfferNotifier for FlakyNotifier {
        async fn notify(
            &self,
            driver: &DriverRecord,
            offer: &TripOfferEvent,
        ) -> Result<(), DeliveryError> {
            self.attempted.lock().unwrap().push(driver.id.clone());
            if self.failing.contains(&driver.id) {
                return Err(DeliveryError::Rejected("simulated outage".into()));
            }
            self.inner.notify(driver, offer).await
        }
    }

    fn trip(id: &str, status: TripStatus, driver_id: Option<&str>) -> TripRecord {
        TripRecord {
            id: id.into(),
            title: "Weekend in Borovoe".into(),
            status,
            driver_id: driver_id.map(str::to_string),
            origin_name: "Astana".into(),
            dest_name: "Borovoe".into(),
            origin: None,
            vehicle_type: None,
            updated_at: Utc::now(),
        }
    }

    fn driver(id: &str, status: DriverStatus) -> DriverRecord {
        DriverRecord {
            id: id.into(),
            name: id.into(),
            status,
            vehicle_type: None,
            location: None,
            last_active_at: Utc::now(),
        }
    }

    struct Harness {
        store: Arc<InMemoryDispatchStore>,
        trip_streams: ConnectionRegistry,
        driver_streams: ConnectionRegistry,
        broadcaster: TripOfferBroadcaster,
        notifier: Arc<FlakyNotifier>,
    }

    fn harness(failing: &[&str]) -> Harness {
        let store = InMemoryDispatchStore::new();
        let trip_streams = ConnectionRegistry::new("trip", 8);
        let driver_streams = ConnectionRegistry::new("driver", 8);
        let notifier = Arc::new(FlakyNotifier {
            inner: StoreNotifier::new(store.clone(), driver_streams.clone()),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            attempted: Mutex::new(Vec::new()),
        });
        let broadcaster = TripOfferBroadcaster::new(
            store.clone(),
            Arc::new(AvailabilityMatcher::new(store.clone(), 50.0)),
            notifier.clone(),
            StatusBroadcaster::new(trip_streams.clone()),
            chrono::Duration::seconds(300),
        );
        Harness {
            store,
            trip_streams,
            driver_streams,
            broadcaster,
            notifier,
        }
    }

    #[tokio::test]
    async fn partial_delivery_still_offers_trip() {
        let h = harness(&["D2"]);
        h.store
            .upsert_trip(trip("T1", TripStatus::Published, None))
            .await
            .unwrap();
        for id in ["D1", "D2", "D3"] {
            h.store
                .upsert_driver(driver(id, DriverStatus::Available))
                .await
                .unwrap();
        }

        let outcome = h.broadcaster.broadcast_trip_offer("T1").await.unwrap();
        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.eligible, 3);
        assert!(outcome.marked_offered);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].driver_id, "D2");
        assert_eq!(h.notifier.attempted.lock().unwrap().len(), 3);

        for (id, expected) in [("D1", 1), ("D2", 0), ("D3", 1)] {
            let notes = h.store.notifications_for_driver(id).await.unwrap();
            assert_eq!(notes.len(), expected, "notifications for {id}");
        }
        let stored = h.store.get_trip("T1").await.unwrap().unwrap();
        assert_eq!(stored.status, TripStatus::Offered);
        let offer = h.store.get_offer("T1").await.unwrap().unwrap();
        assert_eq!((offer.sent_count, offer.eligible_count), (2, 3));
    }

    #[tokio::test]
    async fn rejects_assigned_or_unpublished_trips_without_side_effects() {
        let rejected = || {
            metrics::OFFER_BROADCASTS
                .with_label_values(&["rejected"])
                .get()
        };
        let rejected_before = rejected();
        let h = harness(&[]);
        h.store
            .upsert_trip(trip("taken", TripStatus::Published, Some("D9")))
            .await
            .unwrap();
        h.store
            .upsert_trip(trip("draft", TripStatus::Draft, None))
            .await
            .unwrap();
        h.store
            .upsert_driver(driver("D1", DriverStatus::Available))
            .await
            .unwrap();

        let err = h.broadcaster.broadcast_trip_offer("taken").await.unwrap_err();
        assert!(matches!(err, DispatchError::DriverAlreadyAssigned));
        let err = h.broadcaster.broadcast_trip_offer("draft").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidStatus {
                actual: TripStatus::Draft,
                ..
            }
        ));
        let err = h.broadcaster.broadcast_trip_offer("nope").await.unwrap_err();
        assert!(matches!(err, DispatchError::TripNotFound));
        // counter is process-wide; other tests only ever add to it
        assert!(rejected() >= rejected_before + 3);

        assert!(h.notifier.attempted.lock().unwrap().is_empty());
        assert!(h.store.notifications_for_driver("D1").await.unwrap().is_empty());
        assert_eq!(
            h.store.get_trip("draft").await.unwrap().unwrap().status,
            TripStatus::Draft
        );
        assert!(h.store.get_offer("taken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_eligible_drivers_leaves_trip_published() {
        let h = harness(&[]);
        h.store
            .upsert_trip(trip("T1", TripStatus::Published, None))
            .await
            .unwrap();
        h.store
            .upsert_driver(driver("D1", DriverStatus::Offline))
            .await
            .unwrap();

        let outcome = h.broadcaster.broadcast_trip_offer("T1").await.unwrap();
        assert_eq!((outcome.sent, outcome.eligible), (0, 0));
        assert!(!outcome.marked_offered);
        assert_eq!(
            h.store.get_trip("T1").await.unwrap().unwrap().status,
            TripStatus::Published
        );
    }

    #[tokio::test]
    async fn pushes_offer_and_status_to_open_streams() {
        use tokio_stream::StreamExt;

        let h = harness(&[]);
        h.store
            .upsert_trip(trip("T1", TripStatus::Published, None))
            .await
            .unwrap();
        h.store
            .upsert_driver(driver("D1", DriverStatus::Available))
            .await
            .unwrap();
        let mut driver_stream = h.driver_streams.subscribe("D1");
        let mut trip_stream = h.trip_streams.subscribe("T1");

        h.broadcaster.broadcast_trip_offer("T1").await.unwrap();

        let offer: serde_json::Value =
            serde_json::from_str(&driver_stream.next().await.unwrap()).unwrap();
        assert_eq!(offer["type"], "trip_offer");
        assert_eq!(offer["tripId"], "T1");
        let status: serde_json::Value =
            serde_json::from_str(&trip_stream.next().await.unwrap()).unwrap();
        assert_eq!(status["previousStatus"], "PUBLISHED");
        assert_eq!(status["newStatus"], "OFFERED");

        let err = h.broadcaster.broadcast_trip_offer("T1").await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidStatus { .. }));
    }
}
