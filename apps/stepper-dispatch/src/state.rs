use std::sync::Arc;
use std::time::Instant;

use stepper_sdk::store::{DispatchStore, InMemoryDispatchStore};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::lifecycle::TripLifecycle;
use crate::maintenance::AvailabilityMaintenance;
use crate::matching::AvailabilityMatcher;
use crate::offer::{OfferNotifier, StoreNotifier, TripOfferBroadcaster};
use crate::registry::ConnectionRegistry;
use crate::schedules::ScheduleService;
use crate::status::StatusBroadcaster;
use crate::store_postgres::PostgresDispatchStore;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    config: Arc<AppConfig>,
    store: Arc<dyn DispatchStore>,
    trip_streams: ConnectionRegistry,
    driver_streams: ConnectionRegistry,
    offers: TripOfferBroadcaster,
    maintenance: AvailabilityMaintenance,
    lifecycle: TripLifecycle,
    schedules: ScheduleService,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn DispatchStore>) -> Self {
        let driver_streams = ConnectionRegistry::new("driver", config.stream_buffer);
        let notifier = Arc::new(StoreNotifier::new(store.clone(), driver_streams.clone()));
        Self::with_notifier(config, store, driver_streams, notifier)
    }

    /// Build with a custom offer delivery channel. `driver_streams` is the
    /// registry served on `/drivers/{id}/offers`.
    pub fn with_notifier(
        config: AppConfig,
        store: Arc<dyn DispatchStore>,
        driver_streams: ConnectionRegistry,
        notifier: Arc<dyn OfferNotifier>,
    ) -> Self {
        let trip_streams = ConnectionRegistry::new("trip", config.stream_buffer);
        let status = StatusBroadcaster::new(trip_streams.clone());
        let matcher = Arc::new(AvailabilityMatcher::new(
            store.clone(),
            config.match_radius_km,
        ));
        let offers = TripOfferBroadcaster::new(
            store.clone(),
            matcher,
            notifier,
            status.clone(),
            config.offer_timeout(),
        );
        let maintenance = AvailabilityMaintenance::new(
            store.clone(),
            status.clone(),
            config.stale_driver_after(),
        );
        let lifecycle = TripLifecycle::new(store.clone(), status);
        let schedules = ScheduleService::new(store.clone());
        Self {
            start: Instant::now(),
            config: Arc::new(config),
            store,
            trip_streams,
            driver_streams,
            offers,
            maintenance,
            lifecycle,
            schedules,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DispatchStore> {
        Arc::clone(&self.store)
    }

    pub fn trip_streams(&self) -> &ConnectionRegistry {
        &self.trip_streams
    }

    pub fn driver_streams(&self) -> &ConnectionRegistry {
        &self.driver_streams
    }

    pub fn offers(&self) -> &TripOfferBroadcaster {
        &self.offers
    }

    pub fn maintenance(&self) -> &AvailabilityMaintenance {
        &self.maintenance
    }

    pub fn lifecycle(&self) -> &TripLifecycle {
        &self.lifecycle
    }

    pub fn schedules(&self) -> &ScheduleService {
        &self.schedules
    }

    /// Trips with at least one open status stream on this instance.
    pub fn active_trip_ids(&self) -> Vec<String> {
        self.trip_streams.active_keys()
    }
}

/// Postgres when `DATABASE_URL` is set and reachable, otherwise in-memory.
pub async fn build_store(cfg: &AppConfig) -> Arc<dyn DispatchStore> {
    let Some(url) = cfg.database_url.as_deref() else {
        info!("DATABASE_URL not set; running in in-memory mode");
        return InMemoryDispatchStore::new();
    };
    match PostgresDispatchStore::connect(url).await {
        Ok(store) => {
            info!("connected to postgres; migrations applied");
            Arc::new(store)
        }
        Err(err) => {
            warn!(error = %err, "failed to connect to database, continuing with in-memory state");
            InMemoryDispatchStore::new()
        }
    }
}
