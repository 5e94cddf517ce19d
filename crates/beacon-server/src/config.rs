//! Aggregate configuration for the composition root.

use beacon_bus::{BusConfig, RegistryConfig, TrackerConfig};
use beacon_metrics::MetricsConfig;
use beacon_notify::NotifierConfig;
use beacon_persistence::RetentionConfig;
use beacon_replay::ReplayConfig;
use beacon_sessions::{BatcherConfig, SessionConfig};

#[derive(Clone)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub sessions: SessionConfig,
    pub batcher: BatcherConfig,
    pub tracker: TrackerConfig,
    pub registry: RegistryConfig,
    pub retention: RetentionConfig,
    pub replay: ReplayConfig,
    pub notifier: NotifierConfig,
    pub metrics: MetricsConfig,
    /// The metrics sampler is optional; producers outside the process may
    /// already cover the host.
    pub metrics_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            sessions: SessionConfig::default(),
            batcher: BatcherConfig::default(),
            tracker: TrackerConfig::default(),
            registry: RegistryConfig::default(),
            retention: RetentionConfig::default(),
            replay: ReplayConfig::default(),
            notifier: NotifierConfig::default(),
            metrics: MetricsConfig::default(),
            metrics_enabled: true,
        }
    }
}

impl AppConfig {
    /// Defaults plus environment overrides for the operationally
    /// interesting knobs.
    pub fn from_env() -> Self {
        let mut config = Self {
            sessions: SessionConfig::from_env(),
            ..Default::default()
        };
        if let Ok(raw) = std::env::var("BEACON_BUS_QUEUE_CAPACITY") {
            if let Ok(value) = raw.parse() {
                config.bus.queue_capacity = value;
            }
        }
        if let Ok(raw) = std::env::var("BEACON_BUS_WORKERS") {
            if let Ok(value) = raw.parse() {
                config.bus.worker_count = value;
            }
        }
        if let Ok(raw) = std::env::var("BEACON_METRICS_ENABLED") {
            config.metrics_enabled = raw != "0" && !raw.eq_ignore_ascii_case("false");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = AppConfig::default();
        assert_eq!(config.bus.queue_capacity, 10_000);
        assert_eq!(config.sessions.max_per_user, 10);
        assert_eq!(config.sessions.max_global, 500);
        assert_eq!(config.batcher.max_queue_size, 1000);
        assert!(config.metrics_enabled);
    }
}
