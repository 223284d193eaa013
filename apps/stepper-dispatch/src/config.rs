use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub cron_secret: Option<String>,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_stale_driver_secs")]
    pub stale_driver_secs: u64,
    #[serde(default = "default_offer_timeout_secs")]
    pub offer_timeout_secs: u64,
    #[serde(default = "default_match_radius_km")]
    pub match_radius_km: f64,
    #[serde(default)]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_addr: default_bind_addr(),
            database_url: None,
            log_filter: None,
            app_env: default_app_env(),
            cron_secret: None,
            instance_id: default_instance_id(),
            stale_driver_secs: default_stale_driver_secs(),
            offer_timeout_secs: default_offer_timeout_secs(),
            match_radius_km: default_match_radius_km(),
            maintenance_interval_secs: 0,
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment (and `.env`). A value that fails to
    /// parse is an error; it never falls back to development defaults.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_environment(config::Environment::default().separator("__"))
    }

    fn from_environment(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.log_filter = Self::normalize_opt(self.log_filter.take())
            .or_else(|| Self::normalize_opt(std::env::var("RUST_LOG").ok()));
        self.cron_secret = Self::normalize_opt(self.cron_secret.take());
        self.app_env = self.app_env.trim().to_ascii_lowercase();
        if self.stream_buffer == 0 {
            self.stream_buffer = default_stream_buffer();
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn is_production(&self) -> bool {
        matches!(self.app_env.as_str(), "production" | "prod")
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or("info,stepper_dispatch=debug")
    }

    pub fn stale_driver_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_driver_secs as i64)
    }

    pub fn offer_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offer_timeout_secs as i64)
    }

    /// `None` when the in-process maintenance ticker is disabled.
    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.maintenance_interval_secs > 0)
            .then(|| Duration::from_secs(self.maintenance_interval_secs))
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

fn default_instance_id() -> String {
    "dispatch-1".to_string()
}

fn default_stale_driver_secs() -> u64 {
    4 * 60 * 60
}

fn default_offer_timeout_secs() -> u64 {
    300
}

fn default_match_radius_km() -> f64 {
    50.0
}

fn default_stream_buffer() -> usize {
    32
}
