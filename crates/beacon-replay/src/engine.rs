//! The replay engine. Each started replay runs as its own cancellable
//! worker that paces persisted events against a wall-clock origin, so
//! scaling stays drift-free across long replays.

use beacon_persistence::{EventQuery, EventStore, Repository, ReplayStore};
use beacon_types::replay::{MAX_REPLAY_RANGE_DAYS, MAX_REPLAY_SPEED};
use beacon_types::{
    BeaconError, EventFilter, ReplaySession, Result, SessionRouter, UserDirectory,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Progress is persisted every this many emitted events.
    pub progress_stride: u64,
    /// Cap on events loaded into one replay.
    pub max_events: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            progress_stride: 10,
            max_events: 100_000,
        }
    }
}

pub struct ReplayEngine {
    repository: Arc<dyn Repository>,
    router: Arc<dyn SessionRouter>,
    directory: Arc<dyn UserDirectory>,
    config: ReplayConfig,
    active: DashMap<Uuid, CancellationToken>,
}

impl ReplayEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        router: Arc<dyn SessionRouter>,
        directory: Arc<dyn UserDirectory>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            repository,
            router,
            directory,
            config,
            active: DashMap::new(),
        }
    }

    /// Validate, persist a pending replay session and launch its worker.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        user_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        filter: EventFilter,
        speed_multiplier: u32,
    ) -> Result<Uuid> {
        if name.trim().is_empty() {
            return Err(BeaconError::validation("replay name must not be empty"));
        }
        if end_time <= start_time {
            return Err(BeaconError::validation("end_time must be after start_time"));
        }
        if end_time - start_time > ChronoDuration::days(MAX_REPLAY_RANGE_DAYS) {
            return Err(BeaconError::validation(format!(
                "replay range exceeds {MAX_REPLAY_RANGE_DAYS} days"
            )));
        }
        if speed_multiplier < 1 || speed_multiplier > MAX_REPLAY_SPEED {
            return Err(BeaconError::validation(format!(
                "speed_multiplier must be between 1 and {MAX_REPLAY_SPEED}"
            )));
        }
        filter.validate()?;

        let replay = ReplaySession::new(name, user_id, start_time, end_time, filter, speed_multiplier);
        let replay_id = replay.id;
        self.repository.store_replay(&replay).await?;

        let token = CancellationToken::new();
        self.active.insert(replay_id, token.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_replay(replay_id, token).await;
            engine.active.remove(&replay_id);
        });

        info!(replay_id = %replay_id, user_id, name, speed_multiplier, "Replay started");
        Ok(replay_id)
    }

    /// Cancel a running replay. Owner or admin only; stopping an already
    /// terminal replay is a no-op.
    pub async fn stop(&self, replay_id: Uuid, actor: &str) -> Result<()> {
        let replay = self
            .repository
            .get_replay(replay_id)
            .await?
            .ok_or_else(|| BeaconError::not_found("replay", replay_id.to_string()))?;

        if replay.user_id != actor && !self.directory.is_admin(actor) {
            return Err(BeaconError::permission_denied(format!(
                "user {actor} does not own replay {replay_id}"
            )));
        }

        if let Some((_, token)) = self.active.remove(&replay_id) {
            token.cancel();
            info!(replay_id = %replay_id, actor, "Replay cancellation requested");
        }
        Ok(())
    }

    pub async fn status(&self, replay_id: Uuid) -> Result<ReplaySession> {
        self.repository
            .get_replay(replay_id)
            .await?
            .ok_or_else(|| BeaconError::not_found("replay", replay_id.to_string()))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ReplaySession>> {
        self.repository.list_replays_for_user(user_id).await
    }

    pub fn running_count(&self) -> usize {
        self.active.len()
    }

    async fn run_replay(&self, replay_id: Uuid, token: CancellationToken) {
        match self.drive_replay(replay_id, token).await {
            Ok(()) => {}
            Err(e) => {
                warn!(replay_id = %replay_id, error = %e, "Replay failed");
                if let Ok(Some(mut replay)) = self.repository.get_replay(replay_id).await {
                    replay.mark_failed(e.to_string());
                    let _ = self.repository.store_replay(&replay).await;
                }
            }
        }
    }

    async fn drive_replay(&self, replay_id: Uuid, token: CancellationToken) -> Result<()> {
        let mut replay = self
            .repository
            .get_replay(replay_id)
            .await?
            .ok_or_else(|| BeaconError::not_found("replay", replay_id.to_string()))?;

        replay.mark_running();
        self.repository.store_replay(&replay).await?;

        let query = EventQuery::range(replay.start_time, replay.end_time)
            .with_filter(replay.filter.clone())
            .with_limit(self.config.max_events);
        let events = self.repository.query_events(&query).await?;

        replay.total_events = events.len() as u64;
        self.repository.store_replay(&replay).await?;

        if events.is_empty() {
            replay.update_progress(0);
            replay.mark_completed();
            self.repository.store_replay(&replay).await?;
            info!(replay_id = %replay_id, "Replay completed with no matching events");
            return Ok(());
        }

        let first_timestamp = events[0].created_at;
        let origin = Instant::now();
        let speed = replay.speed_multiplier.max(1);

        for (index, event) in events.iter().enumerate() {
            let offset = (event.created_at - first_timestamp)
                .to_std()
                .unwrap_or_default();
            let target = origin + offset / speed;

            tokio::select! {
                _ = token.cancelled() => {
                    replay.update_progress(index as u64);
                    replay.mark_cancelled();
                    self.repository.store_replay(&replay).await?;
                    info!(replay_id = %replay_id, processed = index, "Replay cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(target) => {}
            }

            let frame = json!({
                "type": "replayed_event",
                "replay_id": replay_id,
                "replay_name": replay.name,
                "original_timestamp": event.created_at,
                "event": event.to_frame(),
                "timestamp": Utc::now(),
            });
            // Replays address only their owner; a closed session is the
            // owner's loss, not a retryable delivery.
            if let Err(e) = self.router.send_to_user(&replay.user_id, frame).await {
                debug!(replay_id = %replay_id, error = %e, "Replay emission not delivered");
            }

            let processed = index as u64 + 1;
            if processed % self.config.progress_stride == 0 {
                replay.update_progress(processed);
                self.repository.store_replay(&replay).await?;
            }
        }

        replay.update_progress(replay.total_events);
        replay.mark_completed();
        self.repository.store_replay(&replay).await?;
        info!(
            replay_id = %replay_id,
            total_events = replay.total_events,
            "Replay completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_persistence::{EventStore, InMemoryRepository};
    use beacon_types::{Event, EventType, ReplayStatus};
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct StaticDirectory;

    impl UserDirectory for StaticDirectory {
        fn is_admin(&self, user_id: &str) -> bool {
            user_id == "root"
        }

        fn admin_user_ids(&self) -> Vec<String> {
            vec!["root".into()]
        }
    }

    /// Records each frame with the paused-clock instant it arrived at.
    #[derive(Default)]
    struct TimingRouter {
        frames: Mutex<Vec<(String, Value, Instant)>>,
    }

    #[async_trait]
    impl SessionRouter for TimingRouter {
        async fn send_to_user(&self, user_id: &str, frame: Value) -> Result<usize> {
            self.frames
                .lock()
                .await
                .push((user_id.to_string(), frame, Instant::now()));
            Ok(1)
        }

        async fn send_to_session(&self, _session_id: Uuid, _frame: Value) -> Result<()> {
            Ok(())
        }

        async fn broadcast(&self, _frame: Value) -> Result<usize> {
            Ok(0)
        }
    }

    fn engine_with(
        repo: Arc<InMemoryRepository>,
    ) -> (Arc<ReplayEngine>, Arc<TimingRouter>) {
        let router = Arc::new(TimingRouter::default());
        let engine = Arc::new(ReplayEngine::new(
            repo,
            router.clone(),
            Arc::new(StaticDirectory),
            ReplayConfig::default(),
        ));
        (engine, router)
    }

    async fn seed_event(
        repo: &Arc<InMemoryRepository>,
        created_at: DateTime<Utc>,
        event_type: EventType,
    ) -> Event {
        let mut event = Event::new(event_type, Map::new());
        event.created_at = created_at;
        repo.store_event(&event).await.unwrap();
        event
    }

    async fn wait_terminal(engine: &Arc<ReplayEngine>, replay_id: Uuid) -> ReplaySession {
        for _ in 0..200 {
            let replay = engine.status(replay_id).await.unwrap();
            if replay.status.is_terminal() {
                return replay;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replay never reached a terminal state");
    }

    #[tokio::test]
    async fn validation_rejects_bad_parameters() {
        let (engine, _) = engine_with(Arc::new(InMemoryRepository::new()));
        let start = Utc::now() - ChronoDuration::hours(1);
        let end = Utc::now();

        // inverted range
        let inverted = engine
            .start("r", "u1", end, start, EventFilter::default(), 1)
            .await;
        assert!(matches!(inverted, Err(BeaconError::Validation { .. })));

        // range over the 7 day cap
        let too_long = engine
            .start(
                "r",
                "u1",
                end - ChronoDuration::days(8),
                end,
                EventFilter::default(),
                1,
            )
            .await;
        assert!(matches!(too_long, Err(BeaconError::Validation { .. })));

        // speed out of [1, 10]
        for speed in [0, 11] {
            let bad_speed = engine
                .start("r", "u1", start, end, EventFilter::default(), speed)
                .await;
            assert!(matches!(bad_speed, Err(BeaconError::Validation { .. })));
        }
    }

    #[tokio::test]
    async fn empty_replay_completes_immediately() {
        let (engine, router) = engine_with(Arc::new(InMemoryRepository::new()));
        let replay_id = engine
            .start(
                "empty",
                "u1",
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
                EventFilter::default(),
                1,
            )
            .await
            .unwrap();

        let replay = wait_terminal(&engine, replay_id).await;
        assert_eq!(replay.status, ReplayStatus::Completed);
        assert_eq!(replay.progress, 100);
        assert_eq!(replay.total_events, 0);
        assert!(router.frames.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_paces_events_at_the_requested_speed() {
        let repo = Arc::new(InMemoryRepository::new());
        let base = Utc::now() - ChronoDuration::hours(1);
        seed_event(&repo, base, EventType::ZoneCreated).await;
        seed_event(&repo, base + ChronoDuration::seconds(10), EventType::ZoneUpdated).await;
        seed_event(&repo, base + ChronoDuration::seconds(40), EventType::ZoneDeleted).await;

        let (engine, router) = engine_with(repo);
        let replay_id = engine
            .start(
                "hour-of-zones",
                "u1",
                base - ChronoDuration::seconds(1),
                base + ChronoDuration::seconds(60),
                EventFilter::default(),
                2,
            )
            .await
            .unwrap();

        let replay = wait_terminal(&engine, replay_id).await;
        assert_eq!(replay.status, ReplayStatus::Completed);
        assert_eq!(replay.total_events, 3);
        assert_eq!(replay.processed_events, 3);
        assert_eq!(replay.progress, 100);

        let frames = router.frames.lock().await;
        assert_eq!(frames.len(), 3);
        // owner-only addressing
        assert!(frames.iter().all(|(user, _, _)| user == "u1"));
        // wrapper shape
        assert_eq!(frames[0].1["type"], "replayed_event");
        assert_eq!(frames[0].1["event"]["type"], "zone_created");
        assert_eq!(frames[1].1["event"]["type"], "zone_updated");
        assert_eq!(frames[2].1["event"]["type"], "zone_deleted");

        // 0s, 10s, 40s offsets at speed 2 arrive at 0s, 5s, 20s
        let origin = frames[0].2;
        let second = frames[1].2.duration_since(origin);
        let third = frames[2].2.duration_since(origin);
        assert!(
            (second.as_millis() as i64 - 5_000i64).abs() < 100,
            "second emission at {second:?}"
        );
        assert!(
            (third.as_millis() as i64 - 20_000i64).abs() < 100,
            "third emission at {third:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replay_filter_limits_the_event_set() {
        let repo = Arc::new(InMemoryRepository::new());
        let base = Utc::now() - ChronoDuration::hours(1);
        seed_event(&repo, base, EventType::ZoneCreated).await;
        seed_event(&repo, base + ChronoDuration::seconds(1), EventType::SecurityAlert).await;

        let (engine, router) = engine_with(repo);
        let replay_id = engine
            .start(
                "security-only",
                "u1",
                base - ChronoDuration::seconds(1),
                base + ChronoDuration::seconds(60),
                EventFilter::for_types(vec![EventType::SecurityAlert]),
                10,
            )
            .await
            .unwrap();

        let replay = wait_terminal(&engine, replay_id).await;
        assert_eq!(replay.total_events, 1);
        let frames = router.frames.lock().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1["event"]["type"], "security_alert");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_running_replay() {
        let repo = Arc::new(InMemoryRepository::new());
        let base = Utc::now() - ChronoDuration::hours(2);
        for offset in 0..10 {
            seed_event(
                &repo,
                base + ChronoDuration::seconds(offset * 60),
                EventType::HealthUpdate,
            )
            .await;
        }

        let (engine, _) = engine_with(repo);
        let replay_id = engine
            .start(
                "long-replay",
                "u1",
                base - ChronoDuration::seconds(1),
                base + ChronoDuration::hours(1),
                EventFilter::default(),
                1,
            )
            .await
            .unwrap();

        // let the worker emit at least the first event, then cancel
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop(replay_id, "u1").await.unwrap();

        let replay = wait_terminal(&engine, replay_id).await;
        assert_eq!(replay.status, ReplayStatus::Cancelled);
        assert!(replay.processed_events < replay.total_events);
        assert_eq!(engine.running_count(), 0);
    }

    #[tokio::test]
    async fn stop_enforces_ownership() {
        let repo = Arc::new(InMemoryRepository::new());
        let (engine, _) = engine_with(repo);
        let replay_id = engine
            .start(
                "mine",
                "u1",
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
                EventFilter::default(),
                1,
            )
            .await
            .unwrap();

        let denied = engine.stop(replay_id, "u2").await;
        assert!(matches!(denied, Err(BeaconError::PermissionDenied { .. })));

        // admin may stop anyone's replay
        engine.stop(replay_id, "root").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_replay_is_not_found() {
        let (engine, _) = engine_with(Arc::new(InMemoryRepository::new()));
        let missing = engine.status(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(BeaconError::NotFound { .. })));
        let stop = engine.stop(Uuid::new_v4(), "u1").await;
        assert!(matches!(stop, Err(BeaconError::NotFound { .. })));
    }
}
