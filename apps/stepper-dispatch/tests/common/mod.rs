#![allow(dead_code)]

use axum::body::{self, Body};
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use stepper_sdk::models::{DriverRecord, DriverStatus, TripRecord, TripStatus};
use stepper_sdk::store::DispatchStore;
use tower::util::ServiceExt;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn trip(id: &str, status: TripStatus) -> TripRecord {
    TripRecord {
        id: id.into(),
        title: format!("Trip {id}"),
        status,
        driver_id: None,
        origin_name: "Almaty".into(),
        dest_name: "Big Almaty Lake".into(),
        origin: None,
        vehicle_type: None,
        updated_at: Utc::now(),
    }
}

pub fn driver(id: &str, status: DriverStatus, last_active_at: DateTime<Utc>) -> DriverRecord {
    DriverRecord {
        id: id.into(),
        name: format!("Driver {id}"),
        status,
        vehicle_type: None,
        location: None,
        last_active_at,
    }
}

pub async fn seed(
    store: &dyn DispatchStore,
    trips: Vec<TripRecord>,
    drivers: Vec<DriverRecord>,
) -> TestResult {
    for t in trips {
        store.upsert_trip(t).await?;
    }
    for d in drivers {
        store.upsert_driver(d).await?;
    }
    Ok(())
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_empty(uri: &str) -> Request<Body> {
    Request::post(uri).body(Body::empty()).unwrap()
}
