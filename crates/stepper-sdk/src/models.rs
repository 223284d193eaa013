//! Records exchanged between the dispatch service, its persistence backends and
//! the wider StepperGO platform.
//!
//! Status enums travel as SCREAMING_SNAKE_CASE strings both on the wire and in
//! Postgres `TEXT` columns, so every enum carries `as_str` / `FromStr`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Draft,
    Published,
    Offered,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

wire_enum!(TripStatus, "trip status", {
    Draft => "DRAFT",
    Published => "PUBLISHED",
    Offered => "OFFERED",
    Assigned => "ASSIGNED",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

impl TripStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Published,
    Offered,
    Assigned,
    Expired,
}

wire_enum!(OfferStatus, "offer status", {
    Published => "PUBLISHED",
    Offered => "OFFERED",
    Assigned => "ASSIGNED",
    Expired => "EXPIRED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Available,
    Busy,
    OnTrip,
    Offline,
    ScheduledBreak,
    Unavailable,
}

wire_enum!(DriverStatus, "driver status", {
    Available => "AVAILABLE",
    Busy => "BUSY",
    OnTrip => "ON_TRIP",
    Offline => "OFFLINE",
    ScheduledBreak => "SCHEDULED_BREAK",
    Unavailable => "UNAVAILABLE",
});

impl DriverStatus {
    /// Statuses a driver should only hold while a trip is live.
    pub const TRANSITIONAL: [DriverStatus; 2] = [DriverStatus::Busy, DriverStatus::OnTrip];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    ScheduledBreak,
    Offline,
    Unavailable,
}

wire_enum!(ScheduleType, "schedule type", {
    ScheduledBreak => "SCHEDULED_BREAK",
    Offline => "OFFLINE",
    Unavailable => "UNAVAILABLE",
});

impl ScheduleType {
    /// Driver status a schedule of this type imposes while it is in force.
    pub fn target_status(&self) -> DriverStatus {
        match self {
            ScheduleType::ScheduledBreak => DriverStatus::ScheduledBreak,
            ScheduleType::Offline => DriverStatus::Offline,
            ScheduleType::Unavailable => DriverStatus::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    System,
    Driver,
    Trip,
    Admin,
}

wire_enum!(TriggerSource, "trigger source", {
    System => "system",
    Driver => "driver",
    Trip => "trip",
    Admin => "admin",
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    const EARTH_RADIUS_KM: f64 = 6_371.0;

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_lng / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripRecord {
    pub id: String,
    pub title: String,
    pub status: TripStatus,
    pub driver_id: Option<String>,
    pub origin_name: String,
    pub dest_name: String,
    pub origin: Option<GeoPoint>,
    pub vehicle_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripOfferRecord {
    pub trip_id: String,
    pub status: OfferStatus,
    pub eligible_count: u32,
    pub sent_count: u32,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRecord {
    pub id: String,
    pub name: String,
    pub status: DriverStatus,
    pub vehicle_type: Option<String>,
    pub location: Option<GeoPoint>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub id: String,
    pub driver_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub schedule_type: ScheduleType,
    pub is_active: bool,
    pub notes: Option<String>,
}

impl ScheduleRecord {
    pub fn in_force_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= now && now < self.ends_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityHistoryRecord {
    pub id: String,
    pub driver_id: String,
    pub previous_status: DriverStatus,
    pub new_status: DriverStatus,
    pub reason: String,
    pub triggered_by: TriggerSource,
    pub schedule_id: Option<String>,
    pub trip_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AvailabilityHistoryRecord {
    pub fn new(
        driver_id: impl Into<String>,
        previous_status: DriverStatus,
        new_status: DriverStatus,
        reason: impl Into<String>,
        triggered_by: TriggerSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            driver_id: driver_id.into(),
            previous_status,
            new_status,
            reason: reason.into(),
            triggered_by,
            schedule_id: None,
            trip_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub driver_id: String,
    pub trip_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub const TRIP_OFFER_NOTIFICATION: &str = "TRIP_OFFER";
