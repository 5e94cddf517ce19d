//! Periodic system sampling and threshold alerting. The collector is a
//! pure producer: everything it learns becomes an event on the bus.

use beacon_bus::{EmitOptions, EventBus};
use beacon_types::{Event, EventPriority, EventType};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Sampling cadence.
    pub interval: Duration,
    /// Whether samples are persisted like ordinary events. Off by default;
    /// metrics are high-volume and replayable from the source host.
    pub persist_samples: bool,
    pub cpu_alert_threshold: f32,
    pub memory_alert_threshold: f64,
    pub disk_alert_threshold: f64,
    /// Minimum gap between two alerts for the same resource.
    pub alert_cooldown: chrono::Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            persist_samples: false,
            cpu_alert_threshold: 90.0,
            memory_alert_threshold: 90.0,
            disk_alert_threshold: 95.0,
            alert_cooldown: chrono::Duration::minutes(5),
        }
    }
}

/// One host sample.
#[derive(Debug, Clone)]
pub struct SystemSample {
    pub cpu_percent: f32,
    pub load_average: (f64, f64, f64),
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub process_count: usize,
    pub uptime_secs: u64,
}

impl SystemSample {
    /// Capture a sample from the host.
    pub fn capture() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_all();

        let cpu_percent = system.global_cpu_usage();
        let memory_total = system.total_memory();
        let memory_used = system.used_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let load = sysinfo::System::load_average();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut disk_total = 0u64;
        let mut disk_available = 0u64;
        for disk in disks.list() {
            disk_total += disk.total_space();
            disk_available += disk.available_space();
        }
        let disk_used = disk_total.saturating_sub(disk_available);
        let disk_percent = if disk_total > 0 {
            disk_used as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        let networks = sysinfo::Networks::new_with_refreshed_list();
        let mut network_rx = 0u64;
        let mut network_tx = 0u64;
        for (_, data) in networks.iter() {
            network_rx += data.total_received();
            network_tx += data.total_transmitted();
        }

        Self {
            cpu_percent,
            load_average: (load.one, load.five, load.fifteen),
            memory_total_bytes: memory_total,
            memory_used_bytes: memory_used,
            memory_percent,
            swap_total_bytes: system.total_swap(),
            swap_used_bytes: system.used_swap(),
            disk_total_bytes: disk_total,
            disk_used_bytes: disk_used,
            disk_percent,
            network_rx_bytes: network_rx,
            network_tx_bytes: network_tx,
            process_count: system.processes().len(),
            uptime_secs: sysinfo::System::uptime(),
        }
    }

    /// Event payload for a `system_metrics` event.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("cpu_percent".into(), json!(self.cpu_percent));
        data.insert(
            "load_average".into(),
            json!({
                "one": self.load_average.0,
                "five": self.load_average.1,
                "fifteen": self.load_average.2,
            }),
        );
        data.insert(
            "memory".into(),
            json!({
                "total_bytes": self.memory_total_bytes,
                "used_bytes": self.memory_used_bytes,
                "percent": self.memory_percent,
            }),
        );
        data.insert(
            "swap".into(),
            json!({
                "total_bytes": self.swap_total_bytes,
                "used_bytes": self.swap_used_bytes,
            }),
        );
        data.insert(
            "disk".into(),
            json!({
                "total_bytes": self.disk_total_bytes,
                "used_bytes": self.disk_used_bytes,
                "percent": self.disk_percent,
            }),
        );
        data.insert(
            "network".into(),
            json!({
                "rx_bytes": self.network_rx_bytes,
                "tx_bytes": self.network_tx_bytes,
            }),
        );
        data.insert("process_count".into(), json!(self.process_count));
        data.insert("uptime_secs".into(), json!(self.uptime_secs));
        data
    }
}

/// A threshold breach worth a `performance_alert`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAlert {
    pub resource: &'static str,
    pub value: f64,
    pub threshold: f64,
}

/// Threshold checks with a per-resource cooldown so alerts don't flap.
pub struct AlertGate {
    config: MetricsConfig,
    last_alert: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

impl AlertGate {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Alerts due for this sample. Firing an alert starts its cooldown.
    pub fn due(&self, sample: &SystemSample, now: DateTime<Utc>) -> Vec<ResourceAlert> {
        let candidates = [
            (
                "cpu",
                sample.cpu_percent as f64,
                self.config.cpu_alert_threshold as f64,
            ),
            (
                "memory",
                sample.memory_percent,
                self.config.memory_alert_threshold,
            ),
            ("disk", sample.disk_percent, self.config.disk_alert_threshold),
        ];

        let mut last_alert = self
            .last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        candidates
            .into_iter()
            .filter(|(resource, value, threshold)| {
                if value < threshold {
                    return false;
                }
                let cooled_down = last_alert
                    .get(resource)
                    .map(|at| now - *at >= self.config.alert_cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    last_alert.insert(resource, now);
                }
                cooled_down
            })
            .map(|(resource, value, threshold)| ResourceAlert {
                resource,
                value,
                threshold,
            })
            .collect()
    }
}

pub struct MetricsCollector {
    bus: Arc<EventBus>,
    config: MetricsConfig,
    gate: AlertGate,
    samples_emitted: AtomicU64,
    alerts_emitted: AtomicU64,
}

impl MetricsCollector {
    pub fn new(bus: Arc<EventBus>, config: MetricsConfig) -> Self {
        Self {
            bus,
            gate: AlertGate::new(config.clone()),
            config,
            samples_emitted: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
        }
    }

    /// Sample the host once and emit the resulting events.
    pub async fn collect_once(&self) {
        let sample = SystemSample::capture();
        self.emit_sample(&sample).await;
    }

    /// Emit events for a sample. Split from [`Self::collect_once`] so tests
    /// can feed synthetic samples.
    pub async fn emit_sample(&self, sample: &SystemSample) {
        let event = Event::new(EventType::SystemMetrics, sample.to_data())
            .with_priority(EventPriority::Low)
            .with_source_service("beacon-metrics")
            .with_source_component("system");

        let options = EmitOptions {
            persist: self.config.persist_samples,
            broadcast_immediately: None,
        };
        match self.bus.emit_with(event, options).await {
            Ok(_) => {
                self.samples_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "Failed to emit system metrics"),
        }

        for alert in self.gate.due(sample, Utc::now()) {
            let mut data = Map::new();
            data.insert("resource".into(), json!(alert.resource));
            data.insert("value".into(), json!(alert.value));
            data.insert("threshold".into(), json!(alert.threshold));
            let alert_event = Event::new(EventType::PerformanceAlert, data)
                .with_source_service("beacon-metrics")
                .with_source_component(alert.resource);
            match self.bus.emit_with(alert_event, EmitOptions::default()).await {
                Ok(_) => {
                    self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        resource = alert.resource,
                        value = alert.value,
                        "Performance alert emitted"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to emit performance alert"),
            }
        }
    }

    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted.load(Ordering::Relaxed)
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::Relaxed)
    }

    /// Spawn the sampling loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = collector.config.interval.as_secs(),
                "Metrics collector started"
            );
            let mut ticker = tokio::time::interval(collector.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Metrics collector stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // sysinfo sampling is blocking but cheap; keep it
                        // off the hot path regardless
                        collector.collect_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_sample() -> SystemSample {
        SystemSample {
            cpu_percent: 10.0,
            load_average: (0.5, 0.4, 0.3),
            memory_total_bytes: 8 * 1024 * 1024 * 1024,
            memory_used_bytes: 2 * 1024 * 1024 * 1024,
            memory_percent: 25.0,
            swap_total_bytes: 0,
            swap_used_bytes: 0,
            disk_total_bytes: 100_000,
            disk_used_bytes: 50_000,
            disk_percent: 50.0,
            network_rx_bytes: 1000,
            network_tx_bytes: 2000,
            process_count: 120,
            uptime_secs: 3600,
        }
    }

    #[test]
    fn sample_payload_shape() {
        let data = synthetic_sample().to_data();
        assert_eq!(data["cpu_percent"], json!(10.0));
        assert_eq!(data["memory"]["percent"], json!(25.0));
        assert_eq!(data["disk"]["used_bytes"], json!(50_000));
        assert_eq!(data["load_average"]["one"], json!(0.5));
        assert_eq!(data["process_count"], json!(120));
    }

    #[test]
    fn capture_returns_plausible_values() {
        let sample = SystemSample::capture();
        assert!(sample.memory_total_bytes > 0);
        assert!(sample.cpu_percent >= 0.0);
        assert!(sample.process_count > 0);
    }

    #[test]
    fn gate_fires_only_over_threshold() {
        let gate = AlertGate::new(MetricsConfig::default());
        let now = Utc::now();

        assert!(gate.due(&synthetic_sample(), now).is_empty());

        let mut hot = synthetic_sample();
        hot.cpu_percent = 95.0;
        hot.disk_percent = 96.0;
        let alerts = gate.due(&hot, now);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].resource, "cpu");
        assert_eq!(alerts[1].resource, "disk");
    }

    #[test]
    fn gate_cooldown_suppresses_repeat_alerts() {
        let gate = AlertGate::new(MetricsConfig::default());
        let now = Utc::now();
        let mut hot = synthetic_sample();
        hot.memory_percent = 99.0;

        assert_eq!(gate.due(&hot, now).len(), 1);
        // still hot one minute later: cooldown holds it back
        assert!(gate.due(&hot, now + chrono::Duration::minutes(1)).is_empty());
        // cooldown elapsed: fires again
        assert_eq!(gate.due(&hot, now + chrono::Duration::minutes(6)).len(), 1);
    }
}
