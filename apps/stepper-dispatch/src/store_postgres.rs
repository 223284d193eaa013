use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use stepper_sdk::models::{
    AvailabilityHistoryRecord, DriverRecord, DriverStatus, GeoPoint, NotificationRecord,
    OfferStatus, ScheduleRecord, TripOfferRecord, TripRecord, TripStatus,
};
use stepper_sdk::store::{AssignOutcome, DispatchStore, ScheduleClosed, StoreError};

const TRIP_COLUMNS: &str = "id, title, status, driver_id, origin_name, dest_name, \
     origin_lat, origin_lng, vehicle_type, updated_at";
const OFFER_COLUMNS: &str =
    "trip_id, status, eligible_count, sent_count, offered_at, expires_at";
const DRIVER_COLUMNS: &str = "id, name, status, vehicle_type, lat, lng, last_active_at";
const SCHEDULE_COLUMNS: &str =
    "id, driver_id, starts_at, ends_at, schedule_type, is_active, notes";
const HISTORY_COLUMNS: &str = "id, driver_id, previous_status, new_status, reason, \
     triggered_by, schedule_id, trip_id, created_at";
const NOTIFICATION_COLUMNS: &str = "id, driver_id, trip_id, kind, title, body, created_at";

pub struct PostgresDispatchStore {
    pool: PgPool,
}

impl PostgresDispatchStore {
    /// Connect and apply the crate's migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(db_err)?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DispatchStore for PostgresDispatchStore {
    async fn upsert_trip(&self, trip: TripRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trips (id, title, status, driver_id, origin_name, dest_name,
                               origin_lat, origin_lng, vehicle_type, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title,
                status = EXCLUDED.status,
                driver_id = EXCLUDED.driver_id,
                origin_name = EXCLUDED.origin_name,
                dest_name = EXCLUDED.dest_name,
                origin_lat = EXCLUDED.origin_lat,
                origin_lng = EXCLUDED.origin_lng,
                vehicle_type = EXCLUDED.vehicle_type,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&trip.id)
        .bind(&trip.title)
        .bind(trip.status.as_str())
        .bind(&trip.driver_id)
        .bind(&trip.origin_name)
        .bind(&trip.dest_name)
        .bind(trip.origin.as_ref().map(|p| p.lat))
        .bind(trip.origin.as_ref().map(|p| p.lng))
        .bind(&trip.vehicle_type)
        .bind(trip.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_trip(&self, trip_id: &str) -> Result<Option<TripRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = $1"))
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(trip_from_row).transpose()
    }

    async fn mark_trip_offered(&self, offer: TripOfferRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                UPDATE trips
                SET status = 'OFFERED', updated_at = $5
                WHERE id = $1 AND status = 'PUBLISHED' AND driver_id IS NULL
                RETURNING id
            )
            INSERT INTO trip_offers (trip_id, status, eligible_count, sent_count, offered_at, expires_at)
            SELECT id, $2, $3, $4, $5, $6 FROM moved
            ON CONFLICT (trip_id) DO UPDATE
            SET status = EXCLUDED.status,
                eligible_count = EXCLUDED.eligible_count,
                sent_count = EXCLUDED.sent_count,
                offered_at = EXCLUDED.offered_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&offer.trip_id)
        .bind(offer.status.as_str())
        .bind(offer.eligible_count as i32)
        .bind(offer.sent_count as i32)
        .bind(offer.offered_at)
        .bind(offer.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_offer(&self, trip_id: &str) -> Result<Option<TripOfferRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM trip_offers WHERE trip_id = $1"
        ))
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn expired_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TripOfferRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM trip_offers \
             WHERE status = 'OFFERED' AND expires_at <= $1 ORDER BY expires_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(offer_from_row).collect()
    }

    async fn expire_offer(
        &self,
        trip_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TripRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let closed = sqlx::query(
            "UPDATE trip_offers SET status = 'EXPIRED' WHERE trip_id = $1 AND status = 'OFFERED'",
        )
        .bind(trip_id)
        .execute(tx.as_mut())
        .await
        .map_err(db_err)?;
        if closed.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "UPDATE trips SET status = 'PUBLISHED', updated_at = $2 \
             WHERE id = $1 AND status = 'OFFERED' AND driver_id IS NULL \
             RETURNING {TRIP_COLUMNS}"
        ))
        .bind(trip_id)
        .bind(now)
        .fetch_optional(tx.as_mut())
        .await
        .map_err(db_err)?;
        let trip = row.as_ref().map(trip_from_row).transpose()?;
        tx.commit().await.map_err(db_err)?;
        Ok(trip)
    }

    async fn assign_trip(
        &self,
        trip_id: &str,
        history: AvailabilityHistoryRecord,
    ) -> Result<AssignOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let open = sqlx::query(
            "SELECT id FROM trips WHERE id = $1 AND status = 'OFFERED' AND driver_id IS NULL \
             FOR UPDATE",
        )
        .bind(trip_id)
        .fetch_optional(tx.as_mut())
        .await
        .map_err(db_err)?;
        if open.is_none() {
            return Ok(AssignOutcome::TripNotOpen);
        }
        if !apply_driver_transition(&mut tx, &history).await? {
            return Ok(AssignOutcome::DriverUnavailable);
        }
        sqlx::query("UPDATE trip_offers SET status = 'ASSIGNED' WHERE trip_id = $1")
            .bind(trip_id)
            .execute(tx.as_mut())
            .await
            .map_err(db_err)?;
        let row = sqlx::query(&format!(
            "UPDATE trips SET status = 'ASSIGNED', driver_id = $2, updated_at = $3 \
             WHERE id = $1 RETURNING {TRIP_COLUMNS}"
        ))
        .bind(trip_id)
        .bind(&history.driver_id)
        .bind(history.created_at)
        .fetch_one(tx.as_mut())
        .await
        .map_err(db_err)?;
        let trip = trip_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(AssignOutcome::Assigned(trip))
    }

    async fn transition_trip(
        &self,
        trip_id: &str,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE trips SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2 RETURNING {TRIP_COLUMNS}"
        ))
        .bind(trip_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(trip_from_row).transpose()
    }

    async fn upsert_driver(&self, driver: DriverRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO drivers (id, name, status, vehicle_type, lat, lng, last_active_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                status = EXCLUDED.status,
                vehicle_type = EXCLUDED.vehicle_type,
                lat = EXCLUDED.lat,
                lng = EXCLUDED.lng,
                last_active_at = EXCLUDED.last_active_at
            "#,
        )
        .bind(&driver.id)
        .bind(&driver.name)
        .bind(driver.status.as_str())
        .bind(&driver.vehicle_type)
        .bind(driver.location.as_ref().map(|p| p.lat))
        .bind(driver.location.as_ref().map(|p| p.lng))
        .bind(driver.last_active_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DRIVER_COLUMNS} FROM drivers WHERE id = $1"))
            .bind(driver_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(driver_from_row).transpose()
    }

    async fn drivers_with_status(
        &self,
        status: DriverStatus,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DRIVER_COLUMNS} FROM drivers WHERE status = $1 ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(driver_from_row).collect()
    }

    async fn stale_drivers(
        &self,
        statuses: &[DriverStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DriverRecord>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {DRIVER_COLUMNS} FROM drivers \
             WHERE status = ANY($1) AND last_active_at < $2 ORDER BY id"
        ))
        .bind(statuses)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(driver_from_row).collect()
    }

    async fn transition_driver(
        &self,
        history: AvailabilityHistoryRecord,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if !apply_driver_transition(&mut tx, &history).await? {
            return Ok(false);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn history_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<AvailabilityHistoryRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM driver_availability_history \
             WHERE driver_id = $1 ORDER BY created_at, id"
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(history_from_row).collect()
    }

    async fn insert_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO availability_schedules
                (id, driver_id, starts_at, ends_at, schedule_type, is_active, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.driver_id)
        .bind(schedule.starts_at)
        .bind(schedule.ends_at)
        .bind(schedule.schedule_type.as_str())
        .bind(schedule.is_active)
        .bind(&schedule.notes)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM availability_schedules WHERE id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn ended_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM availability_schedules \
             WHERE is_active AND ends_at <= $1 ORDER BY ends_at, id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn schedules_in_force(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM availability_schedules \
             WHERE is_active AND starts_at <= $1 AND ends_at > $1 ORDER BY starts_at, id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn close_schedule(
        &self,
        schedule_id: &str,
        release: Option<AvailabilityHistoryRecord>,
    ) -> Result<ScheduleClosed, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            "UPDATE availability_schedules SET is_active = FALSE WHERE id = $1 AND is_active",
        )
        .bind(schedule_id)
        .execute(tx.as_mut())
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Ok(ScheduleClosed::AlreadyClosed);
        }
        let driver_released = match &release {
            Some(history) => apply_driver_transition(&mut tx, history).await?,
            None => false,
        };
        tx.commit().await.map_err(db_err)?;
        Ok(ScheduleClosed::Closed { driver_released })
    }

    async fn create_notification(
        &self,
        notification: NotificationRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(&notification.id)
        .bind(&notification.driver_id)
        .bind(&notification.trip_id)
        .bind(&notification.kind)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn notifications_for_driver(
        &self,
        driver_id: &str,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE driver_id = $1 ORDER BY created_at, id"
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(NotificationRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    driver_id: row.try_get("driver_id").map_err(db_err)?,
                    trip_id: row.try_get("trip_id").map_err(db_err)?,
                    kind: row.try_get("kind").map_err(db_err)?,
                    title: row.try_get("title").map_err(db_err)?,
                    body: row.try_get("body").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                })
            })
            .collect()
    }
}

/// Conditional driver status change plus its history row, inside `tx`.
/// The caller commits; returning false leaves the transaction to roll back on drop.
async fn apply_driver_transition(
    tx: &mut Transaction<'_, Postgres>,
    history: &AvailabilityHistoryRecord,
) -> Result<bool, StoreError> {
    let updated = sqlx::query(
        "UPDATE drivers SET status = $3, last_active_at = $4 WHERE id = $1 AND status = $2",
    )
    .bind(&history.driver_id)
    .bind(history.previous_status.as_str())
    .bind(history.new_status.as_str())
    .bind(history.created_at)
    .execute(tx.as_mut())
    .await
    .map_err(db_err)?;
    if updated.rows_affected() == 0 {
        return Ok(false);
    }
    sqlx::query(&format!(
        "INSERT INTO driver_availability_history ({HISTORY_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(&history.id)
    .bind(&history.driver_id)
    .bind(history.previous_status.as_str())
    .bind(history.new_status.as_str())
    .bind(&history.reason)
    .bind(history.triggered_by.as_str())
    .bind(&history.schedule_id)
    .bind(&history.trip_id)
    .bind(history.created_at)
    .execute(tx.as_mut())
    .await
    .map_err(db_err)?;
    Ok(true)
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Store(err.to_string())
}

fn enum_col<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(db_err)?;
    raw.parse()
        .map_err(|err: T::Err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn point_cols(row: &PgRow, lat: &str, lng: &str) -> Result<Option<GeoPoint>, StoreError> {
    let lat: Option<f64> = row.try_get(lat).map_err(db_err)?;
    let lng: Option<f64> = row.try_get(lng).map_err(db_err)?;
    Ok(match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    })
}

fn count_col(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column).map_err(db_err)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}: negative count")))
}

fn trip_from_row(row: &PgRow) -> Result<TripRecord, StoreError> {
    Ok(TripRecord {
        id: row.try_get("id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        status: enum_col(row, "status")?,
        driver_id: row.try_get("driver_id").map_err(db_err)?,
        origin_name: row.try_get("origin_name").map_err(db_err)?,
        dest_name: row.try_get("dest_name").map_err(db_err)?,
        origin: point_cols(row, "origin_lat", "origin_lng")?,
        vehicle_type: row.try_get("vehicle_type").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn offer_from_row(row: &PgRow) -> Result<TripOfferRecord, StoreError> {
    Ok(TripOfferRecord {
        trip_id: row.try_get("trip_id").map_err(db_err)?,
        status: enum_col::<OfferStatus>(row, "status")?,
        eligible_count: count_col(row, "eligible_count")?,
        sent_count: count_col(row, "sent_count")?,
        offered_at: row.try_get("offered_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
    })
}

fn driver_from_row(row: &PgRow) -> Result<DriverRecord, StoreError> {
    Ok(DriverRecord {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        status: enum_col(row, "status")?,
        vehicle_type: row.try_get("vehicle_type").map_err(db_err)?,
        location: point_cols(row, "lat", "lng")?,
        last_active_at: row.try_get("last_active_at").map_err(db_err)?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduleRecord, StoreError> {
    Ok(ScheduleRecord {
        id: row.try_get("id").map_err(db_err)?,
        driver_id: row.try_get("driver_id").map_err(db_err)?,
        starts_at: row.try_get("starts_at").map_err(db_err)?,
        ends_at: row.try_get("ends_at").map_err(db_err)?,
        schedule_type: enum_col(row, "schedule_type")?,
        is_active: row.try_get("is_active").map_err(db_err)?,
        notes: row.try_get("notes").map_err(db_err)?,
    })
}

fn history_from_row(row: &PgRow) -> Result<AvailabilityHistoryRecord, StoreError> {
    Ok(AvailabilityHistoryRecord {
        id: row.try_get("id").map_err(db_err)?,
        driver_id: row.try_get("driver_id").map_err(db_err)?,
        previous_status: enum_col(row, "previous_status")?,
        new_status: enum_col(row, "new_status")?,
        reason: row.try_get("reason").map_err(db_err)?,
        triggered_by: enum_col(row, "triggered_by")?,
        schedule_id: row.try_get("schedule_id").map_err(db_err)?,
        trip_id: row.try_get("trip_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Store(e.to_string()))
}
