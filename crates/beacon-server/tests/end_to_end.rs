//! Whole-core flows over real sessions: batched delivery, urgent bypass,
//! the retry ladder and time-scaled replay.

use async_trait::async_trait;
use beacon_bus::TrackerConfig;
use beacon_persistence::{DeliveryStore, EventStore};
use beacon_sessions::transport::{
    ChannelTransport, ClientHandle, SessionTransport, TransportSink, TransportStream,
};
use beacon_sessions::{BatcherConfig, SessionKind};
use beacon_server::{AppConfig, AppCore, StaticAuthProvider, StaticDirectory};
use beacon_types::{
    BeaconError, DeliveryStatus, Event, EventFilter, EventPriority, EventType, Result,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.batcher = BatcherConfig {
        batch_timeout: Duration::from_millis(150),
        adaptive_sizing: false,
        compression_enabled: false,
        ..Default::default()
    };
    config.tracker = TrackerConfig {
        base_backoff: ChronoDuration::milliseconds(100),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    };
    config.metrics_enabled = false;
    config
}

async fn core() -> Arc<AppCore> {
    let auth = Arc::new(
        StaticAuthProvider::new()
            .with_token("user-token", "u1", false)
            .with_token("root-token", "root", true),
    );
    let directory = Arc::new(StaticDirectory::new(["root".to_string()]));
    let app = AppCore::new(test_config(), auth, directory);
    app.start().await.unwrap();
    app
}

async fn open_session(
    app: &Arc<AppCore>,
    token: &str,
    kind: SessionKind,
) -> (uuid::Uuid, ClientHandle) {
    let (transport, mut client) = ChannelTransport::pair();
    let session_id = app
        .sessions()
        .connect(Box::new(transport), token, kind)
        .await
        .unwrap();
    let established = client
        .next_frame_timeout(Duration::from_secs(1))
        .await
        .expect("connection_established");
    assert_eq!(established["type"], "connection_established");
    (session_id, client)
}

fn health_event_for(user: &str) -> Event {
    Event::new(EventType::HealthUpdate, Map::new()).with_target_user(user)
}

#[tokio::test]
async fn targeted_event_arrives_batched_on_the_owner_session() {
    let app = core().await;
    let (_sid, mut client) = open_session(&app, "user-token", SessionKind::Unified).await;

    app.bus().emit(health_event_for("u1")).await.unwrap();

    let frame = client
        .next_frame_timeout(Duration::from_secs(2))
        .await
        .expect("batched frame");
    assert_eq!(frame["type"], "batched_events");
    assert_eq!(frame["batch_size"], 1);
    assert_eq!(frame["events"][0]["type"], "health_update");
    assert_eq!(frame["events"][0]["target_user_id"], "u1");

    app.shutdown().await;
}

#[tokio::test]
async fn urgent_event_overtakes_an_open_batch() {
    let app = core().await;
    let (_sid, mut client) = open_session(&app, "user-token", SessionKind::Unified).await;

    // e1 sits in an open batch; e2 bypasses batching entirely
    app.bus().emit(health_event_for("u1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    app.bus()
        .emit(
            Event::new(EventType::SecurityAlert, Map::new())
                .with_priority(EventPriority::Urgent)
                .with_target_user("u1"),
        )
        .await
        .unwrap();

    let mut arrivals: Vec<String> = Vec::new();
    while arrivals.len() < 2 {
        let frame = client
            .next_frame_timeout(Duration::from_secs(2))
            .await
            .expect("both frames must arrive");
        arrivals.push(frame["type"].as_str().unwrap().to_string());
    }

    // the urgent alert was written before the batch holding e1 flushed
    assert_eq!(arrivals[0], "security_alert");
    assert_eq!(arrivals[1], "batched_events");

    app.shutdown().await;
}

/// Transport whose writes fail a scripted number of times after admission.
struct FlakyTransport {
    inner: Box<ChannelTransport>,
    failures: Arc<AtomicU32>,
}

struct FlakySink {
    inner: Box<dyn TransportSink>,
    failures: Arc<AtomicU32>,
}

impl SessionTransport for FlakyTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        let (sink, stream) = self.inner.split();
        (
            Box::new(FlakySink {
                inner: sink,
                failures: self.failures,
            }),
            stream,
        )
    }
}

#[async_trait]
impl TransportSink for FlakySink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BeaconError::transient_delivery("scripted write failure"));
        }
        self.inner.send_text(text).await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.inner.close(code, reason).await
    }
}

#[tokio::test]
async fn retry_ladder_recovers_after_two_write_failures() {
    let app = core().await;

    let (transport, mut client) = ChannelTransport::pair();
    let failures = Arc::new(AtomicU32::new(0));
    let flaky = FlakyTransport {
        inner: Box::new(transport),
        failures: failures.clone(),
    };
    app.sessions()
        .connect(Box::new(flaky), "user-token", SessionKind::Unified)
        .await
        .unwrap();
    let established = client.next_frame_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(established["type"], "connection_established");

    // the next two writes fail, the third lands
    failures.store(2, Ordering::SeqCst);
    let event = health_event_for("u1");
    let event_id = app
        .bus()
        .emit_with(event, beacon_bus::EmitOptions::immediate())
        .await
        .unwrap();

    // sweeper retries at ~100ms and ~300ms after the first failure
    let frame = client
        .next_frame_timeout(Duration::from_secs(3))
        .await
        .expect("third attempt must deliver");
    assert_eq!(frame["type"], "health_update");

    // final record: delivered on the third attempt
    let mut delivered = None;
    for _ in 0..50 {
        let records = app
            .repository()
            .list_deliveries_for_event(event_id)
            .await
            .unwrap();
        if let Some(record) = records
            .iter()
            .find(|record| record.status == DeliveryStatus::Delivered)
        {
            delivered = Some(record.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = delivered.expect("delivery record should reach delivered");
    assert_eq!(record.attempts, 3);
    assert!(record.delivered_at.is_some());

    app.shutdown().await;
}

#[tokio::test]
async fn replay_reemits_history_to_the_owner_in_order() {
    let app = core().await;
    let (_sid, mut client) = open_session(&app, "user-token", SessionKind::Unified).await;

    let base = Utc::now() - ChronoDuration::hours(1);
    let mut seeded = Vec::new();
    for (offset_ms, event_type) in [
        (0i64, EventType::ZoneCreated),
        (400, EventType::RecordCreated),
        (800, EventType::ZoneDeleted),
    ] {
        let mut event = Event::new(event_type, Map::new());
        event.created_at = base + ChronoDuration::milliseconds(offset_ms);
        app.repository().store_event(&event).await.unwrap();
        seeded.push(event);
    }

    let replay_id = app
        .replay()
        .start(
            "dns-history",
            "u1",
            base - ChronoDuration::seconds(1),
            base + ChronoDuration::seconds(5),
            EventFilter::default(),
            8,
        )
        .await
        .unwrap();

    let mut replayed = Vec::new();
    while replayed.len() < 3 {
        let frame = client
            .next_frame_timeout(Duration::from_secs(3))
            .await
            .expect("replayed frames");
        if frame["type"] == "replayed_event" {
            assert_eq!(frame["replay_id"], json!(replay_id));
            replayed.push(frame["event"]["type"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(replayed, vec!["zone_created", "record_created", "zone_deleted"]);

    // terminal status with full progress
    let mut replay = app.replay().status(replay_id).await.unwrap();
    for _ in 0..50 {
        if replay.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        replay = app.replay().status(replay_id).await.unwrap();
    }
    assert_eq!(replay.status, beacon_types::ReplayStatus::Completed);
    assert_eq!(replay.total_events, 3);
    assert_eq!(replay.processed_events, 3);
    assert_eq!(replay.progress, 100);

    app.shutdown().await;
}

#[tokio::test]
async fn subscribe_events_changes_what_a_session_receives() {
    let app = core().await;
    let (_sid, mut client) = open_session(&app, "user-token", SessionKind::DnsManagement).await;

    // a dns_management session does not carry health traffic by default
    app.bus().emit(health_event_for("u1")).await.unwrap();
    assert!(client.next_frame_timeout(Duration::from_millis(500)).await.is_none());

    client
        .send_json(&json!({
            "type": "subscribe_events",
            "data": {"event_types": ["health_update"]},
        }))
        .unwrap();
    let updated = client.next_frame_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(updated["type"], "subscription_updated");

    app.bus().emit(health_event_for("u1")).await.unwrap();
    let frame = client
        .next_frame_timeout(Duration::from_secs(2))
        .await
        .expect("health update after resubscription");
    assert_eq!(frame["type"], "batched_events");
    assert_eq!(frame["events"][0]["type"], "health_update");

    app.shutdown().await;
}

#[tokio::test]
async fn explicit_subscriptions_fan_out_alongside_session_defaults() {
    let app = core().await;
    let (_sid, mut client) = open_session(&app, "user-token", SessionKind::Unified).await;

    // an extra user-level subscription on the same types doubles delivery
    app.registry()
        .create(
            "u1",
            EventFilter::for_types(vec![EventType::HealthUpdate]),
            None,
            None,
        )
        .await
        .unwrap();

    app.bus().emit(health_event_for("u1")).await.unwrap();

    let mut copies = 0;
    while let Some(frame) = client.next_frame_timeout(Duration::from_millis(800)).await {
        if frame["type"] == "batched_events" {
            copies += frame["events"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|event| event["type"] == "health_update")
                .count();
        }
    }
    assert_eq!(copies, 2);

    app.shutdown().await;
}
