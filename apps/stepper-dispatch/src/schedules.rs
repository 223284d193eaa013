use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepper_sdk::models::{
    AvailabilityHistoryRecord, DriverStatus, ScheduleRecord, ScheduleType, TriggerSource,
};
use stepper_sdk::store::{DispatchStore, ScheduleClosed};
use tracing::info;

use crate::error::DispatchError;

pub const REASON_SCHEDULE_CANCELLED: &str = "schedule cancelled";

/// Driver-declared availability windows. A new window takes effect on the
/// next maintenance run; cancelling one in force releases the driver at once.
#[derive(Clone)]
pub struct ScheduleService {
    store: Arc<dyn DispatchStore>,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    pub async fn create_schedule(
        &self,
        driver_id: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        schedule_type: ScheduleType,
        notes: Option<String>,
    ) -> Result<ScheduleRecord, DispatchError> {
        if starts_at >= ends_at {
            return Err(DispatchError::InvalidSchedule(
                "start must be before end".to_string(),
            ));
        }
        if self.store.get_driver(driver_id).await?.is_none() {
            return Err(DispatchError::DriverNotFound);
        }
        let schedule = ScheduleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            driver_id: driver_id.to_string(),
            starts_at,
            ends_at,
            schedule_type,
            is_active: true,
            notes: notes.filter(|n| !n.trim().is_empty()),
        };
        self.store.insert_schedule(schedule.clone()).await?;
        info!(
            driver_id,
            schedule_id = %schedule.id,
            kind = %schedule_type,
            "availability schedule created"
        );
        Ok(schedule)
    }

    pub async fn cancel_schedule(
        &self,
        driver_id: &str,
        schedule_id: &str,
    ) -> Result<ScheduleRecord, DispatchError> {
        let mut schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .filter(|s| s.driver_id == driver_id)
            .ok_or(DispatchError::ScheduleNotFound)?;
        let was_in_force = schedule.in_force_at(Utc::now());
        schedule.is_active = false;
        let target = schedule.schedule_type.target_status();
        let release = was_in_force.then(|| {
            AvailabilityHistoryRecord::new(
                driver_id,
                target,
                DriverStatus::Available,
                REASON_SCHEDULE_CANCELLED,
                TriggerSource::Driver,
            )
            .with_schedule(schedule_id)
        });
        let driver_released = match self.store.close_schedule(schedule_id, release).await? {
            ScheduleClosed::Closed { driver_released } => driver_released,
            ScheduleClosed::AlreadyClosed => return Ok(schedule),
        };
        info!(
            driver_id,
            schedule_id,
            was_in_force,
            driver_released,
            "availability schedule cancelled"
        );
        Ok(schedule)
    }
}
