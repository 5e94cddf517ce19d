//! Retention sweeper: hourly purge of aged events and terminal delivery
//! records, plus expired subscriptions.

use crate::repository::{DeliveryStore, EventStore, Repository, SubscriptionStore};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Persisted events older than this are deleted.
    pub event_ttl: ChronoDuration,
    /// Terminal delivery records older than this are deleted.
    pub delivery_ttl: ChronoDuration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            event_ttl: ChronoDuration::days(30),
            delivery_ttl: ChronoDuration::days(30),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

pub struct RetentionSweeper {
    repository: Arc<dyn Repository>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(repository: Arc<dyn Repository>, config: RetentionConfig) -> Self {
        Self { repository, config }
    }

    /// Spawn the periodic sweep loop. Stops promptly on cancellation.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                event_ttl_days = self.config.event_ttl.num_days(),
                delivery_ttl_days = self.config.delivery_ttl.num_days(),
                "Retention sweeper started"
            );
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // consume the immediate first tick so the first sweep waits a full interval
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Retention sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }

    /// One full sweep. Failures are logged and retried at the next tick.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        match self
            .repository
            .purge_events_before(now - self.config.event_ttl)
            .await
        {
            Ok(purged) if purged > 0 => debug!(purged, "Purged aged events"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Event retention purge failed"),
        }

        match self
            .repository
            .purge_deliveries_before(now - self.config.delivery_ttl)
            .await
        {
            Ok(purged) if purged > 0 => debug!(purged, "Purged aged delivery records"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Delivery retention purge failed"),
        }

        match self.repository.purge_expired_subscriptions(now).await {
            Ok(purged) if purged > 0 => debug!(purged, "Purged expired subscriptions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Subscription expiry purge failed"),
        }
    }
}
