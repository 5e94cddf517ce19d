//! Delivery tracker: one record per (event, subscription), bounded retries
//! with exponential backoff, and the background retry sweeper.

use async_trait::async_trait;
use beacon_persistence::{DeliveryStore, EventStore, Repository};
use beacon_types::{
    DeliveryRecord, DeliveryReporter, Event, Result, SessionRouter, Subscription,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Backoff base; attempt n waits `base × n` before the next try.
    pub base_backoff: ChronoDuration,
    /// How often the sweeper polls for due retries.
    pub sweep_interval: Duration,
    /// Max records pulled per sweep.
    pub sweep_batch: usize,
    pub default_max_attempts: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_backoff: ChronoDuration::minutes(5),
            sweep_interval: Duration::from_secs(300),
            sweep_batch: 100,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerStats {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    terminal_failures: AtomicU64,
    retries_swept: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct TrackerStatsSnapshot {
    pub delivered: u64,
    pub failed_attempts: u64,
    pub terminal_failures: u64,
    pub retries_swept: u64,
}

pub struct DeliveryTracker {
    repository: Arc<dyn Repository>,
    router: Arc<dyn SessionRouter>,
    config: TrackerConfig,
    stats: TrackerStats,
}

impl DeliveryTracker {
    pub fn new(
        repository: Arc<dyn Repository>,
        router: Arc<dyn SessionRouter>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            repository,
            router,
            config,
            stats: TrackerStats::default(),
        }
    }

    /// Create and persist the record for one (event, subscription) pair.
    pub async fn create_record(
        &self,
        event: &Event,
        subscription: &Subscription,
    ) -> Result<DeliveryRecord> {
        let mut record = DeliveryRecord::new(event.id, subscription.id, &subscription.user_id)
            .with_max_attempts(self.config.default_max_attempts);
        record.session_id = subscription.session_id;
        self.repository.store_delivery(&record).await?;
        Ok(record)
    }

    /// Attempt an immediate delivery and record the outcome. Transient
    /// failures schedule a retry; they are absorbed here, not surfaced.
    pub async fn attempt_immediate(&self, event: &Event, mut record: DeliveryRecord) {
        let outcome = self.send(event, &record).await;
        match outcome {
            Ok(()) => {
                record.record_success();
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                record.record_failure(e.to_string(), self.config.base_backoff);
                self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                if record.is_terminal() {
                    self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    delivery_id = %record.id,
                    attempts = record.attempts,
                    error = %e,
                    "Immediate delivery attempt failed"
                );
            }
        }
        if let Err(e) = self.repository.store_delivery(&record).await {
            warn!(delivery_id = %record.id, error = %e, "Failed to persist delivery outcome");
        }
    }

    async fn send(&self, event: &Event, record: &DeliveryRecord) -> Result<()> {
        let frame = event.to_frame();
        match record.session_id {
            Some(session_id) => self.router.send_to_session(session_id, frame).await,
            None => self.router.send_to_user(&record.user_id, frame).await.map(|_| ()),
        }
    }

    /// One sweep over due retries. Records whose event is gone or expired
    /// are closed out; the rest get another attempt.
    pub async fn sweep_retries(&self) -> Result<u64> {
        let now = Utc::now();
        let due = self
            .repository
            .due_retries(now, self.config.sweep_batch)
            .await?;
        let count = due.len() as u64;

        for mut record in due {
            let event = match self.repository.get_event(record.event_id).await? {
                Some(event) => event,
                None => {
                    // Ephemeral events never persist, so they never reach here;
                    // a missing row means retention already removed it.
                    record.mark_expired("event no longer available");
                    self.repository.store_delivery(&record).await?;
                    continue;
                }
            };

            if event.is_expired() {
                record.mark_expired("event expired");
                self.repository.store_delivery(&record).await?;
                continue;
            }

            match self.send(&event, &record).await {
                Ok(()) => {
                    record.record_success();
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    record.record_failure(e.to_string(), self.config.base_backoff);
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if record.is_terminal() {
                        self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.repository.store_delivery(&record).await?;
            self.stats.retries_swept.fetch_add(1, Ordering::Relaxed);
        }

        Ok(count)
    }

    /// Spawn the periodic retry sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let interval = tracker.config.sweep_interval;
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Delivery retry sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Delivery retry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tracker.sweep_retries().await {
                            Ok(swept) if swept > 0 => {
                                debug!(swept, "Retried due deliveries");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Retry sweep failed"),
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed_attempts: self.stats.failed_attempts.load(Ordering::Relaxed),
            terminal_failures: self.stats.terminal_failures.load(Ordering::Relaxed),
            retries_swept: self.stats.retries_swept.load(Ordering::Relaxed),
        }
    }
}

/// Batch flush outcomes arrive here from the message batcher.
#[async_trait]
impl DeliveryReporter for DeliveryTracker {
    async fn report_success(&self, delivery_ids: &[Uuid]) {
        for id in delivery_ids {
            match self.repository.get_delivery(*id).await {
                Ok(Some(mut record)) => {
                    record.record_success();
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.repository.store_delivery(&record).await {
                        warn!(delivery_id = %id, error = %e, "Failed to persist delivery success");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(delivery_id = %id, error = %e, "Failed to load delivery record"),
            }
        }
    }

    async fn report_failure(&self, delivery_ids: &[Uuid], error: &str) {
        for id in delivery_ids {
            match self.repository.get_delivery(*id).await {
                Ok(Some(mut record)) => {
                    record.record_failure(error, self.config.base_backoff);
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if record.is_terminal() {
                        self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Err(e) = self.repository.store_delivery(&record).await {
                        warn!(delivery_id = %id, error = %e, "Failed to persist delivery failure");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(delivery_id = %id, error = %e, "Failed to load delivery record"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_persistence::{EventStore, InMemoryRepository};
    use beacon_types::{BeaconError, DeliveryStatus, EventFilter, EventType};
    use serde_json::{Map, Value};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    /// Router whose sends fail a scripted number of times, then succeed.
    struct FlakyRouter {
        failures_remaining: AtomicU32,
        sent: Mutex<Vec<Value>>,
    }

    impl FlakyRouter {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_remaining: AtomicU32::new(times),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SessionRouter for FlakyRouter {
        async fn send_to_user(&self, _user_id: &str, frame: Value) -> Result<usize> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(BeaconError::transient_delivery("socket closed"));
            }
            self.sent.lock().await.push(frame);
            Ok(1)
        }

        async fn send_to_session(&self, _session_id: Uuid, frame: Value) -> Result<()> {
            self.send_to_user("", frame).await.map(|_| ())
        }

        async fn broadcast(&self, frame: Value) -> Result<usize> {
            self.sent.lock().await.push(frame);
            Ok(1)
        }
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            base_backoff: ChronoDuration::milliseconds(10),
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn tracked_event(
        repo: &Arc<InMemoryRepository>,
        tracker: &DeliveryTracker,
    ) -> (Event, DeliveryRecord) {
        let event = Event::new(EventType::HealthUpdate, Map::new());
        repo.store_event(&event).await.unwrap();
        let subscription = Subscription::new("u1", EventFilter::default());
        let record = tracker.create_record(&event, &subscription).await.unwrap();
        (event, record)
    }

    #[tokio::test]
    async fn immediate_success_marks_delivered() {
        let repo = Arc::new(InMemoryRepository::new());
        let router = FlakyRouter::failing(0);
        let tracker = DeliveryTracker::new(repo.clone(), router.clone(), fast_config());

        let (event, record) = tracked_event(&repo, &tracker).await;
        let id = record.id;
        tracker.attempt_immediate(&event, record).await;

        let stored = repo.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempts, 1);
        assert!(stored.delivered_at.is_some());
        assert_eq!(router.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn retry_ladder_delivers_on_third_attempt() {
        let repo = Arc::new(InMemoryRepository::new());
        let router = FlakyRouter::failing(2);
        let tracker = DeliveryTracker::new(repo.clone(), router.clone(), fast_config());

        let (event, record) = tracked_event(&repo, &tracker).await;
        let id = record.id;

        tracker.attempt_immediate(&event, record).await;
        let after_first = repo.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(after_first.status, DeliveryStatus::Retrying);
        assert_eq!(after_first.attempts, 1);
        assert!(after_first.retry_after.is_some());

        // second attempt fails, third succeeds
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tracker.sweep_retries().await.unwrap();
        }

        let final_record = repo.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(final_record.status, DeliveryStatus::Delivered);
        assert_eq!(final_record.attempts, 3);
        assert!(final_record.delivered_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_attempts_are_terminal() {
        let repo = Arc::new(InMemoryRepository::new());
        let router = FlakyRouter::failing(u32::MAX);
        let tracker = DeliveryTracker::new(repo.clone(), router, fast_config());

        let (event, record) = tracked_event(&repo, &tracker).await;
        let id = record.id;

        tracker.attempt_immediate(&event, record).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            tracker.sweep_retries().await.unwrap();
        }

        let final_record = repo.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(final_record.status, DeliveryStatus::Failed);
        assert_eq!(final_record.attempts, final_record.max_attempts);
        assert!(final_record.failed_at.is_some());

        // no further attempts are due
        assert!(!final_record.is_due(Utc::now() + ChronoDuration::days(1)));
    }

    #[tokio::test]
    async fn expired_event_closes_record_without_attempt() {
        let repo = Arc::new(InMemoryRepository::new());
        let router = FlakyRouter::failing(1);
        let tracker = DeliveryTracker::new(repo.clone(), router, fast_config());

        let mut event = Event::new(EventType::HealthUpdate, Map::new());
        event.expires_at = Some(Utc::now() + ChronoDuration::milliseconds(15));
        repo.store_event(&event).await.unwrap();
        let subscription = Subscription::new("u1", EventFilter::default());
        let record = tracker.create_record(&event, &subscription).await.unwrap();
        let id = record.id;

        tracker.attempt_immediate(&event, record).await; // fails, schedules retry
        tokio::time::sleep(Duration::from_millis(30)).await; // event expires meanwhile
        tracker.sweep_retries().await.unwrap();

        let final_record = repo.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(final_record.status, DeliveryStatus::Failed);
        assert_eq!(final_record.error_message.as_deref(), Some("event expired"));
        assert_eq!(final_record.attempts, 1); // expiry consumed no attempt
    }

    #[tokio::test]
    async fn reporter_updates_batched_outcomes() {
        let repo = Arc::new(InMemoryRepository::new());
        let router = FlakyRouter::failing(0);
        let tracker = DeliveryTracker::new(repo.clone(), router, fast_config());

        let (_, success_record) = tracked_event(&repo, &tracker).await;
        let (_, failure_record) = tracked_event(&repo, &tracker).await;

        tracker.report_success(&[success_record.id]).await;
        tracker.report_failure(&[failure_record.id], "flush failed").await;

        let delivered = repo.get_delivery(success_record.id).await.unwrap().unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);

        let retrying = repo.get_delivery(failure_record.id).await.unwrap().unwrap();
        assert_eq!(retrying.status, DeliveryStatus::Retrying);
        assert_eq!(retrying.error_message.as_deref(), Some("flush failed"));
    }
}
