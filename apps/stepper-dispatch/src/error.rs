use stepper_sdk::models::TripStatus;
use stepper_sdk::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("trip not found")]
    TripNotFound,
    #[error("driver not found")]
    DriverNotFound,
    #[error("schedule not found")]
    ScheduleNotFound,
    #[error("trip already has a driver assigned")]
    DriverAlreadyAssigned,
    #[error("trip is {actual}, expected {expected}")]
    InvalidStatus {
        expected: TripStatus,
        actual: TripStatus,
    },
    #[error("cannot move trip from {from} to {to}")]
    InvalidTransition { from: TripStatus, to: TripStatus },
    #[error("driver is not available")]
    DriverUnavailable,
    #[error("trip is no longer open for assignment")]
    OfferClosed,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
