//! The event bus: bounded ingress, worker pool, global filters, in-process
//! processors and fan-out to matching subscriptions.

use crate::registry::SubscriptionRegistry;
use crate::tracker::DeliveryTracker;
use async_trait::async_trait;
use beacon_persistence::{EventStore, Repository};
use beacon_types::{BatchSink, BeaconError, DeliveryReporter, Event, EventType, Recipient, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-emit options.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Persist the event before broadcasting (default true). Persistence
    /// failure never aborts delivery; the event just becomes ephemeral.
    pub persist: bool,
    /// Force or suppress the immediate dispatch path. `None` derives the
    /// mode from the event: immediate iff critical type or
    /// critical/urgent priority.
    pub broadcast_immediately: Option<bool>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            persist: true,
            broadcast_immediately: None,
        }
    }
}

impl EmitOptions {
    pub fn ephemeral() -> Self {
        Self {
            persist: false,
            broadcast_immediately: None,
        }
    }

    pub fn immediate() -> Self {
        Self {
            persist: true,
            broadcast_immediately: Some(true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bound on the ingress queue.
    pub queue_capacity: usize,
    /// Number of worker tasks draining the queue.
    pub worker_count: usize,
    /// On a full queue, process the event inline instead of failing the
    /// emit. Best-effort only.
    pub inline_fallback: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            worker_count: 4,
            inline_fallback: true,
        }
    }
}

/// In-process callback invoked after persistence and before broadcast.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, event: &Event) -> Result<()>;
}

type GlobalFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Default)]
pub struct BusStats {
    pub emitted: AtomicU64,
    pub filtered: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub inline_fallbacks: AtomicU64,
    pub deliveries_created: AtomicU64,
    pub processor_errors: AtomicU64,
    pub expired_skipped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct BusStatsSnapshot {
    pub emitted: u64,
    pub filtered: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub inline_fallbacks: u64,
    pub deliveries_created: u64,
    pub processor_errors: u64,
    pub expired_skipped: u64,
    pub queue_depth: usize,
}

struct QueuedEvent {
    event: Event,
    options: EmitOptions,
}

pub struct EventBus {
    config: BusConfig,
    tx: mpsc::Sender<QueuedEvent>,
    rx: Arc<Mutex<mpsc::Receiver<QueuedEvent>>>,
    filters: RwLock<Vec<GlobalFilter>>,
    processors: RwLock<HashMap<EventType, Vec<Arc<dyn EventProcessor>>>>,
    registry: Arc<SubscriptionRegistry>,
    tracker: Arc<DeliveryTracker>,
    batcher: Arc<dyn BatchSink>,
    repository: Arc<dyn Repository>,
    stats: BusStats,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(
        config: BusConfig,
        registry: Arc<SubscriptionRegistry>,
        tracker: Arc<DeliveryTracker>,
        batcher: Arc<dyn BatchSink>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            filters: RwLock::new(Vec::new()),
            processors: RwLock::new(HashMap::new()),
            registry,
            tracker,
            batcher,
            repository,
            stats: BusStats::default(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pool.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_index in 0..self.config.worker_count {
            let bus = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                bus.worker_loop(worker_index).await;
            }));
        }
        info!(workers = self.config.worker_count, "Event bus started");
    }

    /// Stop the worker pool cooperatively. Events still queued are dropped;
    /// ephemeral events do not survive a restart by design.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        info!("Event bus stopped");
    }

    /// Register a global filter. Filters run in registration order; the
    /// first one returning false drops the event.
    pub async fn add_global_filter<F>(&self, filter: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filters.write().await.push(Arc::new(filter));
    }

    /// Register an in-process processor for one event type.
    pub async fn register_processor(
        &self,
        event_type: EventType,
        processor: Arc<dyn EventProcessor>,
    ) {
        self.processors
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(processor);
    }

    /// Register one processor for several event types at once.
    pub async fn register_processor_for(
        &self,
        event_types: &[EventType],
        processor: Arc<dyn EventProcessor>,
    ) {
        let mut processors = self.processors.write().await;
        for event_type in event_types {
            processors
                .entry(*event_type)
                .or_default()
                .push(Arc::clone(&processor));
        }
    }

    /// Emit with default options.
    pub async fn emit(&self, event: Event) -> Result<Uuid> {
        self.emit_with(event, EmitOptions::default()).await
    }

    /// Enqueue an event for processing. On a saturated queue the bus falls
    /// back to best-effort inline processing rather than blocking.
    pub async fn emit_with(&self, event: Event, options: EmitOptions) -> Result<Uuid> {
        validate_event(&event)?;
        let event_id = event.id;
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);

        match self.tx.try_send(QueuedEvent { event, options }) {
            Ok(()) => Ok(event_id),
            Err(mpsc::error::TrySendError::Full(queued)) => {
                if self.config.inline_fallback {
                    self.stats.inline_fallbacks.fetch_add(1, Ordering::Relaxed);
                    debug!(event_id = %event_id, "Ingress queue full, processing inline");
                    self.process_event(queued.event, &queued.options).await;
                    Ok(event_id)
                } else {
                    Err(BeaconError::QueueFull {
                        pending: self.config.queue_capacity,
                    })
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BeaconError::Cancelled),
        }
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            emitted: self.stats.emitted.load(Ordering::Relaxed),
            filtered: self.stats.filtered.load(Ordering::Relaxed),
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            inline_fallbacks: self.stats.inline_fallbacks.load(Ordering::Relaxed),
            deliveries_created: self.stats.deliveries_created.load(Ordering::Relaxed),
            processor_errors: self.stats.processor_errors.load(Ordering::Relaxed),
            expired_skipped: self.stats.expired_skipped.load(Ordering::Relaxed),
            queue_depth: self.config.queue_capacity.saturating_sub(self.tx.capacity()),
        }
    }

    async fn worker_loop(&self, worker_index: usize) {
        debug!(worker_index, "Bus worker started");
        loop {
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => break,
                queued = async { self.rx.lock().await.recv().await } => {
                    match queued {
                        Some(queued) => queued,
                        None => break,
                    }
                }
            };
            self.process_event(queued.event, &queued.options).await;
        }
        debug!(worker_index, "Bus worker stopped");
    }

    /// Full processing pipeline for one event. Ordering across workers is
    /// not preserved; per-session ordering comes from the session writers.
    async fn process_event(&self, event: Event, options: &EmitOptions) {
        // 1. Global filters, in registration order.
        {
            let filters = self.filters.read().await;
            for filter in filters.iter() {
                if !filter(&event) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        // 2. Persist. Failure makes the event ephemeral, never aborts.
        if options.persist {
            match self.repository.store_event(&event).await {
                Ok(()) => {
                    self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event_id = %event.id, error = %e, "Event persistence failed, continuing as ephemeral");
                }
            }
        }

        // 3. In-process processors, sequential; errors logged, not fatal.
        let processors = {
            let registered = self.processors.read().await;
            registered.get(&event.event_type).cloned().unwrap_or_default()
        };
        for processor in processors {
            if let Err(e) = processor.process(&event).await {
                self.stats.processor_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    processor = processor.name(),
                    event_id = %event.id,
                    error = %e,
                    "Event processor failed"
                );
            }
        }

        if event.is_expired() {
            self.stats.expired_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // 4. Broadcast mode: explicit request wins, otherwise derived.
        let immediate = options
            .broadcast_immediately
            .unwrap_or_else(|| event.event_type.is_critical() || event.priority.is_immediate());

        // 5. Fan out to matching subscriptions, one delivery record each.
        let subscriptions = self.registry.match_event(&event);
        for subscription in subscriptions {
            let record = match self.tracker.create_record(&event, &subscription).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        error = %e,
                        "Failed to create delivery record"
                    );
                    continue;
                }
            };
            self.stats.deliveries_created.fetch_add(1, Ordering::Relaxed);

            if immediate {
                self.tracker.attempt_immediate(&event, record).await;
            } else {
                let recipient = match subscription.session_id {
                    Some(session_id) => Recipient::session(&subscription.user_id, session_id),
                    None => Recipient::user(&subscription.user_id),
                };
                if let Err(e) = self
                    .batcher
                    .add(&event, Some(recipient), vec![record.id])
                    .await
                {
                    self.tracker.report_failure(&[record.id], &e.to_string()).await;
                }
            }
        }
    }
}

fn validate_event(event: &Event) -> Result<()> {
    if let Some(expires_at) = event.expires_at {
        if expires_at <= event.created_at {
            return Err(BeaconError::validation("expires_at must be after created_at"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::EventType;
    use chrono::Duration;
    use serde_json::Map;

    #[test]
    fn default_config_bounds() {
        let config = BusConfig::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert!(config.inline_fallback);
    }

    #[test]
    fn emit_options_defaults() {
        let options = EmitOptions::default();
        assert!(options.persist);
        assert!(options.broadcast_immediately.is_none());
        assert!(!EmitOptions::ephemeral().persist);
        assert_eq!(EmitOptions::immediate().broadcast_immediately, Some(true));
    }

    #[test]
    fn validation_rejects_inverted_expiry() {
        let mut event = Event::new(EventType::HealthUpdate, Map::new());
        event.expires_at = Some(event.created_at - Duration::seconds(1));
        assert!(matches!(
            validate_event(&event),
            Err(BeaconError::Validation { .. })
        ));

        event.expires_at = Some(event.created_at + Duration::seconds(60));
        assert!(validate_event(&event).is_ok());
    }
}
