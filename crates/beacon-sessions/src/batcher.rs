//! Per-recipient message batching with adaptive sizing, gzip compression
//! and a priority bypass.
//!
//! Producers never block here: enqueues are non-blocking and overflow drops
//! the oldest queued message. Critical and urgent traffic bypasses the
//! queue entirely, so it can never be lost to the overflow path.

use crate::compress;
use async_trait::async_trait;
use beacon_types::{
    BatchSink, BatchedMessage, DeliveryReporter, Event, EventType, Recipient, Result,
    SessionRouter,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchingStrategy {
    TimeBased,
    SizeBased,
    Hybrid,
    PriorityBased,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub strategy: BatchingStrategy,
    pub max_batch_count: usize,
    pub min_batch_count: usize,
    pub max_batch_bytes: usize,
    pub batch_timeout: Duration,
    pub max_batch_timeout: Duration,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub priority_bypass: bool,
    pub adaptive_sizing: bool,
    /// Bound on each recipient's ingress queue; overflow drops the oldest.
    pub max_queue_size: usize,
    pub load_threshold: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            strategy: BatchingStrategy::Hybrid,
            max_batch_count: 50,
            min_batch_count: 5,
            max_batch_bytes: 64 * 1024,
            batch_timeout: Duration::from_millis(1000),
            max_batch_timeout: Duration::from_millis(5000),
            compression_enabled: true,
            compression_threshold: 1024,
            priority_bypass: true,
            adaptive_sizing: true,
            max_queue_size: 1000,
            load_threshold: 0.8,
        }
    }
}

#[derive(Default)]
struct RecipientState {
    queue: VecDeque<(Event, Vec<Uuid>)>,
    /// Armed while a batch window is open for this recipient.
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Averages {
    batch_size: f64,
    compression_ratio: f64,
}

#[derive(Default)]
struct BatcherMetrics {
    events_processed: AtomicU64,
    batches_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_saved: AtomicU64,
    bypassed: AtomicU64,
    broadcasts: AtomicU64,
    queue_overflows: AtomicU64,
    flush_failures: AtomicU64,
    averages: std::sync::Mutex<Averages>,
}

#[derive(Debug, Clone)]
pub struct BatcherMetricsSnapshot {
    pub events_processed: u64,
    pub batches_sent: u64,
    pub bytes_sent: u64,
    pub bytes_saved: u64,
    pub bypassed: u64,
    pub broadcasts: u64,
    pub queue_overflows: u64,
    pub flush_failures: u64,
    pub average_batch_size: f64,
    pub average_compression_ratio: f64,
}

struct BatcherInner {
    config: BatcherConfig,
    router: Arc<dyn SessionRouter>,
    reporter: Arc<dyn DeliveryReporter>,
    states: dashmap::DashMap<Recipient, Arc<Mutex<RecipientState>>>,
    metrics: BatcherMetrics,
    running: AtomicBool,
    /// EWMA of queue fill ratio, stored as f64 bits.
    load: AtomicU64,
}

#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

impl MessageBatcher {
    pub fn new(
        config: BatcherConfig,
        router: Arc<dyn SessionRouter>,
        reporter: Arc<dyn DeliveryReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                router,
                reporter,
                states: dashmap::DashMap::new(),
                metrics: BatcherMetrics::default(),
                running: AtomicBool::new(false),
                load: AtomicU64::new(0f64.to_bits()),
            }),
        }
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting batched work and drain every open batch.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.flush_all().await;
    }

    pub async fn flush_all(&self) {
        let recipients: Vec<Recipient> = self
            .inner
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for recipient in recipients {
            self.flush_recipient(&recipient, false).await;
        }
    }

    /// Drain one recipient's queue into batches and send them. Called by
    /// the per-recipient timer (`from_timer`), by fullness triggers and on
    /// stop.
    pub async fn flush_recipient(&self, recipient: &Recipient, from_timer: bool) {
        let Some(state_arc) = self
            .inner
            .states
            .get(recipient)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let mut state = state_arc.lock().await;

        if let Some(timer) = state.timer.take() {
            // A timer never aborts itself; every other path cancels it.
            if !from_timer {
                timer.abort();
            }
        }

        let max_bytes = self.inner.config.max_batch_bytes;
        while !state.queue.is_empty() {
            let limit = self.current_batch_size();
            let mut message = BatchedMessage::new();
            let mut delivery_ids = Vec::new();
            while let Some((event, ids)) = state.queue.pop_front() {
                message.add_event(event);
                delivery_ids.extend(ids);
                if message.len() >= limit || message.size_bytes() >= max_bytes {
                    break;
                }
            }
            if !message.is_empty() {
                self.send_batch(recipient, message, delivery_ids).await;
            }
        }
    }

    pub fn metrics(&self) -> BatcherMetricsSnapshot {
        let metrics = &self.inner.metrics;
        let averages = metrics
            .averages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        BatcherMetricsSnapshot {
            events_processed: metrics.events_processed.load(Ordering::Relaxed),
            batches_sent: metrics.batches_sent.load(Ordering::Relaxed),
            bytes_sent: metrics.bytes_sent.load(Ordering::Relaxed),
            bytes_saved: metrics.bytes_saved.load(Ordering::Relaxed),
            bypassed: metrics.bypassed.load(Ordering::Relaxed),
            broadcasts: metrics.broadcasts.load(Ordering::Relaxed),
            queue_overflows: metrics.queue_overflows.load(Ordering::Relaxed),
            flush_failures: metrics.flush_failures.load(Ordering::Relaxed),
            average_batch_size: averages.batch_size,
            average_compression_ratio: averages.compression_ratio,
        }
    }

    fn should_bypass(&self, event: &Event) -> bool {
        if !self.inner.config.priority_bypass {
            return false;
        }
        event.priority.is_immediate()
            || event.event_type.is_critical()
            || matches!(
                event.event_type,
                EventType::Ping | EventType::Pong | EventType::ConnectionEstablished
            )
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.inner.load.load(Ordering::Relaxed))
    }

    fn record_load(&self, queue_len: usize) {
        let ratio = queue_len as f64 / self.inner.config.max_queue_size as f64;
        let current = self.load();
        let next = current * 0.9 + ratio.min(1.0) * 0.1;
        self.inner.load.store(next.to_bits(), Ordering::Relaxed);
    }

    fn adaptive(&self) -> bool {
        self.inner.config.adaptive_sizing
            || self.inner.config.strategy == BatchingStrategy::Adaptive
    }

    /// High load uses full batches; low load trades batch size for latency.
    fn current_batch_size(&self) -> usize {
        let config = &self.inner.config;
        if !self.adaptive() {
            return config.max_batch_count;
        }
        let load = self.load();
        if load > config.load_threshold {
            config.max_batch_count
        } else {
            ((config.max_batch_count as f64 * load) as usize).max(config.min_batch_count)
        }
    }

    /// High load flushes fast; low load lets batches fill longer.
    fn current_timeout(&self) -> Duration {
        let config = &self.inner.config;
        if !self.adaptive() {
            return config.batch_timeout;
        }
        let load = self.load();
        if load > config.load_threshold {
            config.batch_timeout
        } else {
            config
                .batch_timeout
                .mul_f64(1.0 + (1.0 - load))
                .min(config.max_batch_timeout)
        }
    }

    fn arm_timer(&self, recipient: Recipient) -> JoinHandle<()> {
        let batcher = self.clone();
        let timeout = self.current_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            batcher.flush_recipient(&recipient, true).await;
        })
    }

    async fn send_immediate(
        &self,
        event: &Event,
        recipient: Option<&Recipient>,
        delivery_ids: &[Uuid],
    ) {
        let frame = event.to_frame();
        let outcome = match recipient {
            Some(Recipient {
                session_id: Some(session_id),
                ..
            }) => self.inner.router.send_to_session(*session_id, frame).await,
            Some(Recipient { user_id, .. }) => self
                .inner
                .router
                .send_to_user(user_id, frame)
                .await
                .map(|_| ()),
            None => {
                self.inner.metrics.broadcasts.fetch_add(1, Ordering::Relaxed);
                self.inner.router.broadcast(frame).await.map(|_| ())
            }
        };
        match outcome {
            Ok(()) => self.inner.reporter.report_success(delivery_ids).await,
            Err(e) => {
                self.inner
                    .reporter
                    .report_failure(delivery_ids, &e.to_string())
                    .await
            }
        }
    }

    async fn send_batch(
        &self,
        recipient: &Recipient,
        message: BatchedMessage,
        delivery_ids: Vec<Uuid>,
    ) {
        let config = &self.inner.config;
        let batch_len = message.len();
        let mut frame = message.to_frame();
        let mut wire_bytes = frame.to_string().len();

        if config.compression_enabled {
            match compress::maybe_compress(&frame, config.compression_threshold) {
                Ok((wire, true, Some(ratio))) => {
                    let compressed_bytes = wire.to_string().len();
                    self.inner.metrics.bytes_saved.fetch_add(
                        wire_bytes.saturating_sub(compressed_bytes) as u64,
                        Ordering::Relaxed,
                    );
                    {
                        let mut averages = self
                            .inner
                            .metrics
                            .averages
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        averages.compression_ratio = if averages.compression_ratio == 0.0 {
                            ratio
                        } else {
                            averages.compression_ratio * 0.9 + ratio * 0.1
                        };
                    }
                    frame = wire;
                    wire_bytes = compressed_bytes;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Batch compression failed, sending plain");
                }
            }
        }

        let outcome = match recipient.session_id {
            Some(session_id) => self.inner.router.send_to_session(session_id, frame).await,
            None => self
                .inner
                .router
                .send_to_user(&recipient.user_id, frame)
                .await
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => {
                let metrics = &self.inner.metrics;
                let sent = metrics.batches_sent.fetch_add(1, Ordering::Relaxed) + 1;
                metrics
                    .bytes_sent
                    .fetch_add(wire_bytes as u64, Ordering::Relaxed);
                {
                    let mut averages = metrics
                        .averages
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    averages.batch_size =
                        (averages.batch_size * (sent - 1) as f64 + batch_len as f64) / sent as f64;
                }
                self.inner.reporter.report_success(&delivery_ids).await;
            }
            Err(e) => {
                self.inner
                    .metrics
                    .flush_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(user_id = %recipient.user_id, error = %e, "Batch flush failed");
                self.inner
                    .reporter
                    .report_failure(&delivery_ids, &e.to_string())
                    .await;
            }
        }
    }
}

#[async_trait]
impl BatchSink for MessageBatcher {
    async fn add(
        &self,
        event: &Event,
        recipient: Option<Recipient>,
        delivery_ids: Vec<Uuid>,
    ) -> Result<bool> {
        // Critical/urgent and connection-control traffic never waits, and a
        // stopped batcher degrades to pass-through rather than dropping.
        if self.should_bypass(event) || !self.inner.running.load(Ordering::SeqCst) {
            self.inner.metrics.bypassed.fetch_add(1, Ordering::Relaxed);
            self.send_immediate(event, recipient.as_ref(), &delivery_ids).await;
            return Ok(false);
        }

        let Some(recipient) = recipient else {
            // Broadcasts fan out to every session writer as-is; batching
            // them per recipient would just duplicate the frame N times.
            self.send_immediate(event, None, &delivery_ids).await;
            return Ok(false);
        };

        let state_arc = self
            .inner
            .states
            .entry(recipient.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RecipientState::default())))
            .clone();
        let mut state = state_arc.lock().await;

        if state.queue.len() >= self.inner.config.max_queue_size {
            if let Some((dropped, dropped_ids)) = state.queue.pop_front() {
                self.inner
                    .metrics
                    .queue_overflows
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    user_id = %recipient.user_id,
                    dropped_event = %dropped.event_type,
                    "Recipient queue overflow, dropping oldest message"
                );
                if !dropped_ids.is_empty() {
                    self.inner
                        .reporter
                        .report_failure(&dropped_ids, "dropped on queue overflow")
                        .await;
                }
            }
        }

        let must_flush_now = event.priority.is_immediate();
        state.queue.push_back((event.clone(), delivery_ids));
        self.record_load(state.queue.len());
        self.inner
            .metrics
            .events_processed
            .fetch_add(1, Ordering::Relaxed);

        if state.timer.is_none() {
            state.timer = Some(self.arm_timer(recipient.clone()));
        }

        let full = state.queue.len() >= self.current_batch_size();
        drop(state);

        if full || must_flush_now {
            self.flush_recipient(&recipient, false).await;
        }

        Ok(true)
    }
}
