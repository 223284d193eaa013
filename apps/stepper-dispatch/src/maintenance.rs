//! Periodic reconciliation of driver availability and stale offers.
//!
//! Every write here is a conditional store update, so two overlapping runs
//! never apply the same transition twice and a second run right after a first
//! one finds nothing to do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepper_sdk::models::{AvailabilityHistoryRecord, DriverStatus, TripStatus, TriggerSource};
use stepper_sdk::store::{DispatchStore, ScheduleClosed, StoreError};
use stepper_sdk::{MaintenanceError, MaintenanceSummary};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::status::StatusBroadcaster;

pub const REASON_SCHEDULE_ENDED: &str = "schedule ended";
pub const REASON_SCHEDULE_STARTED: &str = "schedule started";
pub const REASON_STALE_RECLAIMED: &str = "stale state reclaimed";

const STEP_SCHEDULES_ENDED: &str = "schedules_ended";
const STEP_SCHEDULES_STARTED: &str = "schedules_started";
const STEP_STALE_DRIVERS: &str = "stale_drivers";
const STEP_OFFER_EXPIRY: &str = "offer_expiry";

#[derive(Clone)]
pub struct AvailabilityMaintenance {
    store: Arc<dyn DispatchStore>,
    status: StatusBroadcaster,
    stale_after: chrono::Duration,
}

impl AvailabilityMaintenance {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        status: StatusBroadcaster,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            status,
            stale_after,
        }
    }

    pub async fn run_maintenance_tasks(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();
        self.expire_schedules(now, &mut summary).await;
        // reclaimed drivers must be AVAILABLE before windows in force are applied
        self.reclaim_stale_drivers(now, &mut summary).await;
        self.apply_started_schedules(now, &mut summary).await;
        self.expire_offers(now, &mut summary).await;

        if summary.is_noop() && summary.errors.is_empty() {
            debug!("availability maintenance found nothing to do");
        } else {
            info!(
                schedules_expired = summary.schedules_expired,
                schedules_applied = summary.schedules_applied,
                drivers_reclaimed = summary.drivers_reclaimed,
                offers_expired = summary.offers_expired,
                errors = summary.errors.len(),
                "availability maintenance complete"
            );
        }
        summary
    }

    async fn expire_schedules(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let schedules = match self.store.ended_schedules(now).await {
            Ok(schedules) => schedules,
            Err(err) => return record_error(summary, STEP_SCHEDULES_ENDED, "*", err),
        };
        for schedule in schedules {
            let target = schedule.schedule_type.target_status();
            let release = system_history(
                &schedule.driver_id,
                target,
                DriverStatus::Available,
                REASON_SCHEDULE_ENDED,
                now,
            )
            .with_schedule(&schedule.id);
            match self.store.close_schedule(&schedule.id, Some(release)).await {
                Ok(ScheduleClosed::Closed { driver_released }) => {
                    summary.schedules_expired += 1;
                    metrics::MAINTENANCE_TRANSITIONS
                        .with_label_values(&["schedule_expired"])
                        .inc();
                    if driver_released {
                        metrics::MAINTENANCE_TRANSITIONS
                            .with_label_values(&["driver_released"])
                            .inc();
                        debug!(
                            schedule_id = %schedule.id,
                            driver_id = %schedule.driver_id,
                            "driver released from ended schedule"
                        );
                    }
                }
                Ok(ScheduleClosed::AlreadyClosed) => {}
                Err(err) => record_error(summary, STEP_SCHEDULES_ENDED, &schedule.id, err),
            }
        }
    }

    async fn apply_started_schedules(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let schedules = match self.store.schedules_in_force(now).await {
            Ok(schedules) => schedules,
            Err(err) => return record_error(summary, STEP_SCHEDULES_STARTED, "*", err),
        };
        for schedule in schedules {
            let target = schedule.schedule_type.target_status();
            let history = system_history(
                &schedule.driver_id,
                DriverStatus::Available,
                target,
                REASON_SCHEDULE_STARTED,
                now,
            )
            .with_schedule(&schedule.id);
            match self.store.transition_driver(history).await {
                Ok(true) => {
                    summary.schedules_applied += 1;
                    metrics::MAINTENANCE_TRANSITIONS
                        .with_label_values(&["schedule_applied"])
                        .inc();
                }
                Ok(false) => {}
                Err(err) => record_error(summary, STEP_SCHEDULES_STARTED, &schedule.id, err),
            }
        }
    }

    async fn reclaim_stale_drivers(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let cutoff = now - self.stale_after;
        let drivers = match self
            .store
            .stale_drivers(&DriverStatus::TRANSITIONAL, cutoff)
            .await
        {
            Ok(drivers) => drivers,
            Err(err) => return record_error(summary, STEP_STALE_DRIVERS, "*", err),
        };
        for driver in drivers {
            let history = system_history(
                &driver.id,
                driver.status,
                DriverStatus::Available,
                REASON_STALE_RECLAIMED,
                now,
            );
            match self.store.transition_driver(history).await {
                Ok(true) => {
                    summary.drivers_reclaimed += 1;
                    metrics::MAINTENANCE_TRANSITIONS
                        .with_label_values(&["driver_reclaimed"])
                        .inc();
                    info!(
                        driver_id = %driver.id,
                        previous = %driver.status,
                        last_active_at = %driver.last_active_at,
                        "reclaimed driver stuck in transitional status"
                    );
                }
                Ok(false) => {}
                Err(err) => record_error(summary, STEP_STALE_DRIVERS, &driver.id, err),
            }
        }
    }

    async fn expire_offers(&self, now: DateTime<Utc>, summary: &mut MaintenanceSummary) {
        let offers = match self.store.expired_offers(now).await {
            Ok(offers) => offers,
            Err(err) => return record_error(summary, STEP_OFFER_EXPIRY, "*", err),
        };
        for offer in offers {
            match self.store.expire_offer(&offer.trip_id, now).await {
                Ok(Some(trip)) => {
                    summary.offers_expired += 1;
                    metrics::MAINTENANCE_TRANSITIONS
                        .with_label_values(&["offer_expired"])
                        .inc();
                    self.status.publish_status_change(
                        &trip,
                        TripStatus::Offered,
                        TripStatus::Published,
                        None,
                        Some("offer expired".to_string()),
                    );
                }
                Ok(None) => {}
                Err(err) => record_error(summary, STEP_OFFER_EXPIRY, &offer.trip_id, err),
            }
        }
    }

    /// Run maintenance every `every` until the returned task is aborted.
    pub fn spawn_ticker(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_maintenance_tasks(Utc::now()).await;
            }
        })
    }
}

fn system_history(
    driver_id: &str,
    from: DriverStatus,
    to: DriverStatus,
    reason: &str,
    at: DateTime<Utc>,
) -> AvailabilityHistoryRecord {
    let mut history =
        AvailabilityHistoryRecord::new(driver_id, from, to, reason, TriggerSource::System);
    history.created_at = at;
    history
}

fn record_error(summary: &mut MaintenanceSummary, step: &str, record_id: &str, err: StoreError) {
    metrics::MAINTENANCE_ERRORS.with_label_values(&[step]).inc();
    warn!(step, record_id, error = %err, "availability maintenance step failed");
    summary.errors.push(MaintenanceError {
        step: step.to_string(),
        record_id: record_id.to_string(),
        message: err.to_string(),
    });
}
