//! AppCore: explicit ownership of every component, no process-wide
//! singletons. A test harness builds a fresh core per test.

use crate::config::AppConfig;
use beacon_bus::{DeliveryTracker, EventBus, SubscriptionRegistry};
use beacon_metrics::MetricsCollector;
use beacon_notify::CriticalNotifier;
use beacon_persistence::{InMemoryRepository, Repository, RetentionSweeper};
use beacon_replay::ReplayEngine;
use beacon_sessions::{MessageBatcher, SessionManager};
use beacon_types::{AuthProvider, Result, UserDirectory};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct AppCore {
    config: AppConfig,
    repository: Arc<dyn Repository>,
    registry: Arc<SubscriptionRegistry>,
    tracker: Arc<DeliveryTracker>,
    batcher: MessageBatcher,
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    replay: Arc<ReplayEngine>,
    notifier: Arc<CriticalNotifier>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppCore {
    /// Wire the full core with the in-memory repository.
    pub fn new(
        config: AppConfig,
        auth: Arc<dyn AuthProvider>,
        directory: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        Self::with_repository(config, auth, directory, Arc::new(InMemoryRepository::new()))
    }

    /// Wire the full core over an externally supplied repository.
    pub fn with_repository<R>(
        config: AppConfig,
        auth: Arc<dyn AuthProvider>,
        directory: Arc<dyn UserDirectory>,
        repository: Arc<R>,
    ) -> Arc<Self>
    where
        R: Repository + 'static,
    {
        let registry = Arc::new(SubscriptionRegistry::new(
            repository.clone(),
            directory.clone(),
            config.registry.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.sessions.clone(),
            auth,
            registry.clone(),
        ));
        let tracker = Arc::new(DeliveryTracker::new(
            repository.clone(),
            sessions.clone(),
            config.tracker.clone(),
        ));
        let batcher = MessageBatcher::new(
            config.batcher.clone(),
            sessions.clone(),
            tracker.clone(),
        );
        let bus = Arc::new(EventBus::new(
            config.bus.clone(),
            registry.clone(),
            tracker.clone(),
            Arc::new(batcher.clone()),
            repository.clone(),
        ));
        let replay = Arc::new(ReplayEngine::new(
            repository.clone(),
            sessions.clone(),
            directory.clone(),
            config.replay.clone(),
        ));
        let notifier = Arc::new(CriticalNotifier::new(
            bus.clone(),
            directory,
            config.notifier.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new(bus.clone(), config.metrics.clone()));

        Arc::new(Self {
            config,
            repository,
            registry,
            tracker,
            batcher,
            sessions,
            bus,
            replay,
            notifier,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bring every component up: load state, start workers and background
    /// loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.load().await?;
        self.bus.start().await;
        self.batcher.start();
        self.notifier.register().await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.notifier.spawn_monitor(self.cancel.child_token()));
        tasks.push(self.tracker.spawn_sweeper(self.cancel.child_token()));
        tasks.push(self.registry.spawn_sweeper(self.cancel.child_token()));
        tasks.push(
            RetentionSweeper::new(self.repository.clone(), self.config.retention.clone())
                .spawn(self.cancel.child_token()),
        );
        if self.config.metrics_enabled {
            tasks.push(self.metrics.spawn(self.cancel.child_token()));
        }

        info!("Beacon core started");
        Ok(())
    }

    /// Cooperative shutdown: stop intake, flush batches, close sessions,
    /// join background loops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.bus.stop().await;
        self.batcher.stop().await;
        self.sessions.shutdown().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("Beacon core stopped");
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn replay(&self) -> &Arc<ReplayEngine> {
        &self.replay
    }

    pub fn notifier(&self) -> &Arc<CriticalNotifier> {
        &self.notifier
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn batcher(&self) -> &MessageBatcher {
        &self.batcher
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }
}
