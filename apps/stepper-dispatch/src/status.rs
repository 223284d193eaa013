use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use stepper_sdk::models::{TripRecord, TripStatus};
use tracing::debug;

use crate::registry::{ConnectionRegistry, FanoutTally};

/// Event pushed to every trip stream when a trip changes status.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub trip_id: String,
    pub trip_title: String,
    pub previous_status: TripStatus,
    pub new_status: TripStatus,
    pub driver_name: Option<String>,
    pub notes: Option<String>,
    pub origin_name: String,
    pub dest_name: String,
    pub timestamp: String,
}

impl StatusChangeEvent {
    pub const KIND: &'static str = "status_change";

    pub fn new(
        trip: &TripRecord,
        previous_status: TripStatus,
        new_status: TripStatus,
        driver_name: Option<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            kind: Self::KIND,
            trip_id: trip.id.clone(),
            trip_title: trip.title.clone(),
            previous_status,
            new_status,
            driver_name,
            notes,
            origin_name: trip.origin_name.clone(),
            dest_name: trip.dest_name.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Fire-and-forget status fan-out over the trip stream registry.
#[derive(Clone)]
pub struct StatusBroadcaster {
    trip_streams: ConnectionRegistry,
}

impl StatusBroadcaster {
    pub fn new(trip_streams: ConnectionRegistry) -> Self {
        Self { trip_streams }
    }

    pub fn publish_status_change(
        &self,
        trip: &TripRecord,
        previous_status: TripStatus,
        new_status: TripStatus,
        driver_name: Option<String>,
        notes: Option<String>,
    ) -> FanoutTally {
        let event = StatusChangeEvent::new(trip, previous_status, new_status, driver_name, notes);
        let tally = self.trip_streams.broadcast(&trip.id, &event);
        debug!(
            trip_id = %trip.id,
            previous = %previous_status,
            new = %new_status,
            delivered = tally.connections,
            failed = tally.failed,
            "status change broadcast"
        );
        tally
    }
}
