//! StepperGO dispatch service: trip offer fan-out, driver availability
//! upkeep and live trip status streams.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod maintenance;
pub mod matching;
pub mod metrics;
pub mod offer;
pub mod registry;
pub mod routes;
pub mod schedules;
pub mod state;
pub mod status;
pub mod store_postgres;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;
