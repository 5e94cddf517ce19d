//! The critical notifier: consumes critical events off the bus, creates
//! per-rule notifications, pushes urgent alerts to target users and drives
//! the escalation monitor.

use crate::rules::{default_rules, CriticalEventRule, EscalationLevel, NotificationChannel};
use async_trait::async_trait;
use beacon_bus::{EmitOptions, EventBus, EventProcessor};
use beacon_types::{
    BeaconError, Event, EventPriority, EventType, Result, UserDirectory,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tracking state for one (event, rule) notification.
#[derive(Debug, Clone)]
pub struct CriticalNotification {
    pub id: Uuid,
    pub event: Event,
    pub rule_id: String,
    pub created_at: DateTime<Utc>,
    pub first_sent_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub escalation_level: EscalationLevel,
    pub escalation_count: u32,
    pub delivery_attempts: u32,
    pub successful_deliveries: u32,
    pub failed_deliveries: u32,
    pub channels_attempted: HashSet<NotificationChannel>,
    pub channels_successful: HashSet<NotificationChannel>,
    pub target_users: HashSet<String>,
    pub notified_users: HashSet<String>,
    pub error_messages: Vec<String>,
}

impl CriticalNotification {
    fn new(event: Event, rule_id: String, target_users: HashSet<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            rule_id,
            created_at: Utc::now(),
            first_sent_at: None,
            last_sent_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            escalation_level: EscalationLevel::None,
            escalation_count: 0,
            delivery_attempts: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            channels_attempted: HashSet::new(),
            channels_successful: HashSet::new(),
            target_users,
            notified_users: HashSet::new(),
            error_messages: Vec::new(),
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// The n-th escalation fires when `now − first_sent_at` passes
    /// `timeout × (escalation_count + 1)` and the rule's cap allows it.
    pub fn should_escalate(&self, rule: &CriticalEventRule, now: DateTime<Utc>) -> bool {
        if !rule.escalation_enabled || self.is_acknowledged() {
            return false;
        }
        if self.escalation_level >= rule.max_escalation_level {
            return false;
        }
        let Some(first_sent_at) = self.first_sent_at else {
            return false;
        };
        let deadline = rule.escalation_timeout.as_secs_f64() * (self.escalation_count + 1) as f64;
        (now - first_sent_at).num_milliseconds() as f64 / 1000.0 >= deadline
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Cadence of the escalation monitor.
    pub monitor_interval: Duration,
    /// Cadence of the history hygiene pass.
    pub hygiene_interval: Duration,
    /// Acknowledged notifications move to history after this long.
    pub acknowledged_retention: chrono::Duration,
    /// Unacknowledged notifications are force-archived after this long.
    pub unacknowledged_retention: chrono::Duration,
    /// Bound on the history list.
    pub history_limit: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            hygiene_interval: Duration::from_secs(3600),
            acknowledged_retention: chrono::Duration::hours(24),
            unacknowledged_retention: chrono::Duration::days(7),
            history_limit: 1000,
        }
    }
}

#[derive(Default)]
struct NotifierStats {
    notifications_created: AtomicU64,
    escalations: AtomicU64,
    acknowledgements: AtomicU64,
    delivery_failures: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct NotifierStatsSnapshot {
    pub active: usize,
    pub history: usize,
    pub notifications_created: u64,
    pub escalations: u64,
    pub acknowledgements: u64,
    pub delivery_failures: u64,
}

pub struct CriticalNotifier {
    bus: Arc<EventBus>,
    directory: Arc<dyn UserDirectory>,
    config: NotifierConfig,
    rules: tokio::sync::RwLock<Vec<CriticalEventRule>>,
    active: DashMap<Uuid, CriticalNotification>,
    history: Mutex<VecDeque<CriticalNotification>>,
    stats: NotifierStats,
}

/// Bus-side tap feeding critical events into the notifier. Holds a weak
/// reference so the bus does not keep the notifier alive.
struct CriticalEventTap {
    notifier: Weak<CriticalNotifier>,
}

#[async_trait]
impl EventProcessor for CriticalEventTap {
    fn name(&self) -> &str {
        "critical_notifier"
    }

    async fn process(&self, event: &Event) -> Result<()> {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.handle_critical_event(event).await;
        }
        Ok(())
    }
}

impl CriticalNotifier {
    pub fn new(
        bus: Arc<EventBus>,
        directory: Arc<dyn UserDirectory>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            bus,
            directory,
            config,
            rules: tokio::sync::RwLock::new(default_rules()),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            stats: NotifierStats::default(),
        }
    }

    /// Register the notifier as an in-process bus processor for every
    /// critical event type.
    pub async fn register(self: &Arc<Self>) {
        let critical: Vec<EventType> = EventType::ALL
            .iter()
            .filter(|event_type| event_type.is_critical())
            .copied()
            .collect();
        let tap = Arc::new(CriticalEventTap {
            notifier: Arc::downgrade(self),
        });
        self.bus.register_processor_for(&critical, tap).await;
        info!(types = critical.len(), "Critical notifier registered on the bus");
    }

    pub async fn add_rule(&self, rule: CriticalEventRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn replace_rules(&self, rules: Vec<CriticalEventRule>) {
        *self.rules.write().await = rules;
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|rule| rule.id != rule_id);
        rules.len() != before
    }

    /// Evaluate rules in registration order; every match produces one
    /// notification with an immediate L1 delivery.
    pub async fn handle_critical_event(&self, event: &Event) {
        let matching: Vec<CriticalEventRule> = {
            let rules = self.rules.read().await;
            rules.iter().filter(|rule| rule.matches(event)).cloned().collect()
        };

        for rule in matching {
            let targets: HashSet<String> = match &rule.target_users {
                Some(users) => users.clone(),
                None => self.directory.admin_user_ids().into_iter().collect(),
            };
            if targets.is_empty() {
                warn!(rule_id = %rule.id, "Critical rule matched but has no target users");
            }

            let mut notification =
                CriticalNotification::new(event.clone(), rule.id.clone(), targets);
            self.stats.notifications_created.fetch_add(1, Ordering::Relaxed);
            debug!(
                notification_id = %notification.id,
                rule_id = %rule.id,
                event_type = %event.event_type,
                "Critical notification created"
            );

            self.deliver(&mut notification).await;
            notification.escalation_level = EscalationLevel::Level1;
            self.active.insert(notification.id, notification);
        }
    }

    /// Acknowledge a notification. Idempotent after the first ack; the
    /// first ack freezes escalation and emits `notification_acknowledged`.
    pub async fn acknowledge(&self, notification_id: Uuid, user_id: &str) -> Result<()> {
        let (event_id, latency_seconds) = {
            let mut entry = self.active.get_mut(&notification_id).ok_or_else(|| {
                BeaconError::not_found("notification", notification_id.to_string())
            })?;
            if entry.is_acknowledged() {
                return Ok(());
            }
            let now = Utc::now();
            entry.acknowledged_at = Some(now);
            entry.acknowledged_by = Some(user_id.to_string());
            let anchor = entry.first_sent_at.unwrap_or(entry.created_at);
            (
                entry.event.id,
                (now - anchor).num_milliseconds() as f64 / 1000.0,
            )
        };
        self.stats.acknowledgements.fetch_add(1, Ordering::Relaxed);
        info!(notification_id = %notification_id, user_id, "Critical notification acknowledged");

        let mut data = serde_json::Map::new();
        data.insert("notification_id".into(), json!(notification_id));
        data.insert("event_id".into(), json!(event_id));
        data.insert("acknowledged_by".into(), json!(user_id));
        data.insert("ack_latency_seconds".into(), json!(latency_seconds));
        let ack_event = Event::new(EventType::NotificationAcknowledged, data)
            .with_source_user(user_id);
        if let Err(e) = self.bus.emit_with(ack_event, EmitOptions::ephemeral()).await {
            warn!(error = %e, "Failed to emit acknowledgement event");
        }
        Ok(())
    }

    /// One escalation monitor pass.
    pub async fn check_escalations(&self) {
        let now = Utc::now();
        let rules = self.rules.read().await.clone();
        let due: Vec<Uuid> = self
            .active
            .iter()
            .filter(|entry| {
                rules
                    .iter()
                    .find(|rule| rule.id == entry.rule_id)
                    .map(|rule| entry.should_escalate(rule, now))
                    .unwrap_or(false)
            })
            .map(|entry| entry.id)
            .collect();

        for notification_id in due {
            let Some(mut entry) = self.active.get_mut(&notification_id) else {
                continue;
            };
            // Re-check under the entry lock; an ack may have landed.
            if entry.is_acknowledged() {
                continue;
            }
            entry.escalation_level = entry.escalation_level.next();
            entry.escalation_count += 1;
            self.stats.escalations.fetch_add(1, Ordering::Relaxed);
            info!(
                notification_id = %notification_id,
                level = ?entry.escalation_level,
                count = entry.escalation_count,
                "Escalating unacknowledged critical notification"
            );
            let mut notification = entry.clone();
            drop(entry);

            self.deliver(&mut notification).await;
            if let Some(mut entry) = self.active.get_mut(&notification_id) {
                entry.first_sent_at = notification.first_sent_at;
                entry.last_sent_at = notification.last_sent_at;
                entry.delivery_attempts = notification.delivery_attempts;
                entry.successful_deliveries = notification.successful_deliveries;
                entry.failed_deliveries = notification.failed_deliveries;
                entry.channels_attempted = notification.channels_attempted;
                entry.channels_successful = notification.channels_successful;
                entry.notified_users = notification.notified_users;
                entry.error_messages = notification.error_messages;
            }
        }
    }

    /// Move aged notifications out of the active set.
    pub async fn run_hygiene(&self) {
        let now = Utc::now();
        let config = &self.config;
        let aged: Vec<Uuid> = self
            .active
            .iter()
            .filter(|entry| match entry.acknowledged_at {
                Some(acked_at) => now - acked_at > config.acknowledged_retention,
                None => now - entry.created_at > config.unacknowledged_retention,
            })
            .map(|entry| entry.id)
            .collect();

        if aged.is_empty() {
            return;
        }
        let mut history = self.history.lock().await;
        for notification_id in aged {
            if let Some((_, notification)) = self.active.remove(&notification_id) {
                if !notification.is_acknowledged() {
                    warn!(
                        notification_id = %notification_id,
                        "Force-archiving unacknowledged critical notification"
                    );
                }
                history.push_back(notification);
                while history.len() > config.history_limit {
                    history.pop_front();
                }
            }
        }
    }

    /// Spawn the escalation monitor and hygiene loop.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut monitor = tokio::time::interval(notifier.config.monitor_interval);
            monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut hygiene = tokio::time::interval(notifier.config.hygiene_interval);
            hygiene.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            monitor.tick().await;
            hygiene.tick().await;
            info!("Critical notification monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Critical notification monitor stopped");
                        break;
                    }
                    _ = monitor.tick() => notifier.check_escalations().await,
                    _ = hygiene.tick() => notifier.run_hygiene().await,
                }
            }
        })
    }

    pub fn get(&self, notification_id: Uuid) -> Option<CriticalNotification> {
        self.active.get(&notification_id).map(|entry| entry.clone())
    }

    pub fn active_notifications(&self) -> Vec<CriticalNotification> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    pub async fn stats(&self) -> NotifierStatsSnapshot {
        NotifierStatsSnapshot {
            active: self.active.len(),
            history: self.history.lock().await.len(),
            notifications_created: self.stats.notifications_created.load(Ordering::Relaxed),
            escalations: self.stats.escalations.load(Ordering::Relaxed),
            acknowledgements: self.stats.acknowledgements.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
        }
    }

    /// Push the notification to every target user as an urgent event
    /// through the bus's immediate path.
    async fn deliver(&self, notification: &mut CriticalNotification) {
        let now = Utc::now();
        notification.channels_attempted.insert(NotificationChannel::Session);
        for target in notification.target_users.clone() {
            let mut data = serde_json::Map::new();
            data.insert("notification_id".into(), json!(notification.id));
            data.insert("rule_id".into(), json!(notification.rule_id));
            data.insert("escalation_level".into(), json!(notification.escalation_level));
            data.insert("escalation_count".into(), json!(notification.escalation_count));
            data.insert("event".into(), notification.event.to_frame());

            let alert = Event::new(EventType::NotificationSent, data)
                .with_priority(EventPriority::Urgent)
                .with_target_user(&target);

            notification.delivery_attempts += 1;
            match self
                .bus
                .emit_with(
                    alert,
                    EmitOptions {
                        persist: false,
                        broadcast_immediately: Some(true),
                    },
                )
                .await
            {
                Ok(_) => {
                    notification.successful_deliveries += 1;
                    notification.channels_successful.insert(NotificationChannel::Session);
                    notification.notified_users.insert(target);
                }
                Err(e) => {
                    notification.failed_deliveries += 1;
                    notification.error_messages.push(e.to_string());
                    self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        notification_id = %notification.id,
                        target,
                        error = %e,
                        "Critical notification delivery failed"
                    );
                }
            }
        }
        if notification.first_sent_at.is_none() {
            notification.first_sent_at = Some(now);
        }
        notification.last_sent_at = Some(now);
    }
}
