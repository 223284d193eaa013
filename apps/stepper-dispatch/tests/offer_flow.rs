mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use stepper_dispatch::config::AppConfig;
use stepper_dispatch::offer::{DeliveryError, OfferNotifier, StoreNotifier, TripOfferEvent};
use stepper_dispatch::registry::ConnectionRegistry;
use stepper_dispatch::routes::build_router;
use stepper_dispatch::state::AppState;
use stepper_sdk::models::{DriverRecord, DriverStatus, TripStatus};
use stepper_sdk::store::{DispatchStore, InMemoryDispatchStore};

use common::*;

/// Store-backed delivery that refuses one driver.
struct RefuseDriver {
    inner: StoreNotifier,
    refused: &'static str,
}

#[async_trait]
impl OfferNotifier for RefuseDriver {
    async fn notify(
        &self,
        driver: &DriverRecord,
        offer: &TripOfferEvent,
    ) -> Result<(), DeliveryError> {
        if driver.id == self.refused {
            return Err(DeliveryError::Rejected("push gateway timeout".into()));
        }
        self.inner.notify(driver, offer).await
    }
}

#[tokio::test]
async fn broadcast_counts_partial_delivery() -> TestResult {
    let store = InMemoryDispatchStore::new();
    let now = Utc::now();
    seed(
        store.as_ref(),
        vec![trip("T1", TripStatus::Published)],
        vec![
            driver("D1", DriverStatus::Available, now),
            driver("D2", DriverStatus::Available, now),
            driver("D3", DriverStatus::Available, now),
        ],
    )
    .await?;
    let driver_streams = ConnectionRegistry::new("driver", 8);
    let notifier = Arc::new(RefuseDriver {
        inner: StoreNotifier::new(store.clone(), driver_streams.clone()),
        refused: "D2",
    });
    let state = AppState::with_notifier(AppConfig::default(), store.clone(), driver_streams, notifier);
    let app = build_router(state);

    let (status, body) = json_body(send(&app, post_empty("/trips/T1/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "success": true,
            "tripId": "T1",
            "tripTitle": "Trip T1",
            "driversNotified": 2,
            "eligibleDrivers": 3
        })
    );
    assert_eq!(store.notifications_for_driver("D1").await?.len(), 1);
    assert!(store.notifications_for_driver("D2").await?.is_empty());
    assert_eq!(store.notifications_for_driver("D3").await?.len(), 1);

    let (status, body) = json_body(send(&app, post_empty("/trips/T1/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    Ok(())
}

#[tokio::test]
async fn broadcast_preconditions_map_to_http_errors() -> TestResult {
    let store = InMemoryDispatchStore::new();
    let mut taken = trip("taken", TripStatus::Published);
    taken.driver_id = Some("D9".into());
    seed(store.as_ref(), vec![taken, trip("draft", TripStatus::Draft)], vec![]).await?;
    let app = build_router(AppState::new(AppConfig::default(), store.clone()));

    let (status, _) = json_body(send(&app, post_empty("/trips/missing/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = json_body(send(&app, post_empty("/trips/taken/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = json_body(send(&app, post_empty("/trips/draft/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(store.get_trip("draft").await?.unwrap().status, TripStatus::Draft);
    assert!(store.get_offer("taken").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn offer_accept_and_complete_over_http() -> TestResult {
    let store = InMemoryDispatchStore::new();
    let now = Utc::now();
    seed(
        store.as_ref(),
        vec![trip("T1", TripStatus::Published)],
        vec![
            driver("D1", DriverStatus::Available, now),
            driver("D2", DriverStatus::Available, now),
        ],
    )
    .await?;
    let app = build_router(AppState::new(AppConfig::default(), store.clone()));

    let (status, _) = json_body(send(&app, post_empty("/trips/T1/broadcast-offer")).await).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        json_body(send(&app, post_json("/trips/T1/accept", json!({ "driverId": "D1" }))).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ASSIGNED");
    assert_eq!(body["driverId"], "D1");

    let (status, _) =
        json_body(send(&app, post_json("/trips/T1/accept", json!({ "driverId": "D2" }))).await).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = json_body(
        send(&app, post_json("/trips/T1/status", json!({ "status": "COMPLETED" }))).await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for next in ["in_progress", "COMPLETED"] {
        let (status, _) = json_body(
            send(&app, post_json("/trips/T1/status", json!({ "status": next, "notes": "ok" }))).await,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "moving to {next}");
    }
    assert_eq!(store.get_driver("D1").await?.unwrap().status, DriverStatus::Available);

    let (status, body) = json_body(
        send(
            &app,
            axum::http::Request::get("/drivers/D1/history")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let reasons: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["reason"].as_str().unwrap())
        .collect();
    assert_eq!(reasons, ["trip assigned", "trip started", "trip completed"]);

    let (status, _) = json_body(
        send(&app, post_json("/trips/T1/status", json!({ "status": "SIDEWAYS" }))).await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn schedules_over_http() -> TestResult {
    let store = InMemoryDispatchStore::new();
    seed(store.as_ref(), vec![], vec![driver("D1", DriverStatus::Available, Utc::now())]).await?;
    let app = build_router(AppState::new(AppConfig::default(), store.clone()));
    let now = Utc::now();

    let (status, _) = json_body(
        send(
            &app,
            post_json(
                "/drivers/D1/schedules",
                json!({
                    "startsAt": now + chrono::Duration::hours(2),
                    "endsAt": now + chrono::Duration::hours(1),
                    "scheduleType": "OFFLINE"
                }),
            ),
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, created) = json_body(
        send(
            &app,
            post_json(
                "/drivers/D1/schedules",
                json!({
                    "startsAt": now + chrono::Duration::hours(1),
                    "endsAt": now + chrono::Duration::hours(2),
                    "scheduleType": "SCHEDULED_BREAK",
                    "notes": "lunch"
                }),
            ),
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let schedule_id = created["id"].as_str().unwrap().to_string();

    let (status, cancelled) = json_body(
        send(
            &app,
            axum::http::Request::delete(format!("/drivers/D1/schedules/{schedule_id}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["isActive"], false);
    assert!(!store.get_schedule(&schedule_id).await?.unwrap().is_active);
    Ok(())
}
