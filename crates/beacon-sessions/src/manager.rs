//! Session manager: admission with caps and auth, a single writer task per
//! session, the inbound control channel and keepalive.
//!
//! Every outbound write funnels through the owning session task's mailbox;
//! that task is the only place touching the transport sink, which is what
//! gives per-session FIFO ordering.

use crate::transport::{SessionTransport, TransportSink, TransportStream};
use crate::types::{
    SessionConfig, SessionInfo, SessionKind, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
    CLOSE_TRY_AGAIN_LATER, REASON_AUTH_REQUIRED, REASON_IDLE, REASON_INVALID_KIND,
    REASON_OVERLOADED, REASON_SHUTDOWN, REASON_TOO_MANY_FOR_USER,
};
use async_trait::async_trait;
use beacon_types::{
    AuthProvider, BeaconError, EventType, Result, SessionRouter, SubscriptionBackend,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Outbound {
    Frame {
        frame: Value,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

struct SessionHandle {
    id: Uuid,
    user_id: String,
    kind: SessionKind,
    outbound: mpsc::Sender<Outbound>,
    connected_at: DateTime<Utc>,
    last_seen: Arc<RwLock<DateTime<Utc>>>,
    message_count: Arc<AtomicU64>,
    subscribed: Arc<RwLock<HashSet<EventType>>>,
}

#[derive(Default)]
struct ManagerStats {
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    frames_dropped: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_capacity: AtomicU64,
    closed_idle: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ManagerStatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub frames_dropped: u64,
    pub rejected_auth: u64,
    pub rejected_capacity: u64,
    pub closed_idle: u64,
}

pub struct SessionManager {
    config: SessionConfig,
    auth: Arc<dyn AuthProvider>,
    subscriptions: Arc<dyn SubscriptionBackend>,
    sessions: DashMap<Uuid, SessionHandle>,
    user_sessions: DashMap<String, HashSet<Uuid>>,
    stats: ManagerStats,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        auth: Arc<dyn AuthProvider>,
        subscriptions: Arc<dyn SubscriptionBackend>,
    ) -> Self {
        Self {
            config,
            auth,
            subscriptions,
            sessions: DashMap::new(),
            user_sessions: DashMap::new(),
            stats: ManagerStats::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Admit a new session: verify the token, enforce caps, materialize the
    /// kind-default subscription, send `connection_established` and hand
    /// the transport to the session task.
    pub async fn connect(
        self: &Arc<Self>,
        transport: Box<dyn SessionTransport>,
        token: &str,
        kind: SessionKind,
    ) -> Result<Uuid> {
        let (mut sink, stream) = transport.split();

        let Some(user) = self.auth.verify(token) else {
            self.stats.rejected_auth.fetch_add(1, Ordering::Relaxed);
            let _ = sink.close(CLOSE_POLICY_VIOLATION, REASON_AUTH_REQUIRED).await;
            return Err(BeaconError::permission_denied(REASON_AUTH_REQUIRED));
        };

        if kind == SessionKind::Admin && !user.is_admin {
            self.stats.rejected_auth.fetch_add(1, Ordering::Relaxed);
            let _ = sink.close(CLOSE_POLICY_VIOLATION, REASON_INVALID_KIND).await;
            return Err(BeaconError::permission_denied(
                "admin connection type requires an admin user",
            ));
        }

        if self.sessions.len() >= self.config.max_global {
            self.stats.rejected_capacity.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = %user.user_id, "Global connection cap reached, rejecting");
            let _ = sink.close(CLOSE_TRY_AGAIN_LATER, REASON_OVERLOADED).await;
            return Err(BeaconError::conflict(REASON_OVERLOADED));
        }

        let user_count = self
            .user_sessions
            .get(&user.user_id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if user_count >= self.config.max_per_user {
            self.stats.rejected_capacity.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = %user.user_id, "Per-user connection cap reached, rejecting");
            let _ = sink
                .close(CLOSE_POLICY_VIOLATION, REASON_TOO_MANY_FOR_USER)
                .await;
            return Err(BeaconError::conflict(REASON_TOO_MANY_FOR_USER));
        }

        let session_id = Uuid::new_v4();
        let default_events = kind.default_event_types();
        let default_subscription_id = self
            .subscriptions
            .create_session_subscription(&user.user_id, session_id, default_events.clone())
            .await?;

        let established = json!({
            "type": "connection_established",
            "data": {
                "session_id": session_id,
                "connection_type": kind,
                "subscribed_event_types": default_events,
            },
            "timestamp": Utc::now(),
        });
        if let Err(e) = sink.send_text(established.to_string()).await {
            let _ = self
                .subscriptions
                .drop_session_subscriptions(session_id)
                .await;
            return Err(e);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let handle = SessionHandle {
            id: session_id,
            user_id: user.user_id.clone(),
            kind,
            outbound: outbound_tx,
            connected_at: Utc::now(),
            last_seen: Arc::new(RwLock::new(Utc::now())),
            message_count: Arc::new(AtomicU64::new(0)),
            subscribed: Arc::new(RwLock::new(default_events.into_iter().collect())),
        };
        let last_seen = handle.last_seen.clone();
        let message_count = handle.message_count.clone();
        let subscribed = handle.subscribed.clone();

        self.sessions.insert(session_id, handle);
        self.user_sessions
            .entry(user.user_id.clone())
            .or_default()
            .insert(session_id);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            session_id = %session_id,
            user_id = %user.user_id,
            connection_type = kind.as_str(),
            "Session established"
        );

        let manager = Arc::clone(self);
        let user_id = user.user_id;
        tokio::spawn(async move {
            manager
                .run_session(SessionTask {
                    session_id,
                    user_id,
                    sink,
                    stream,
                    outbound_rx,
                    last_seen,
                    message_count,
                    subscribed,
                    default_subscription_id,
                })
                .await;
        });

        Ok(session_id)
    }

    /// Close every session owned by a user, e.g. on logout. Returns how
    /// many sessions were told to close.
    pub async fn disconnect_user(&self, user_id: &str, reason: &str) -> usize {
        let ids: Vec<Uuid> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for session_id in &ids {
            self.close_session(*session_id, CLOSE_POLICY_VIOLATION, reason).await;
        }
        info!(user_id, count = ids.len(), reason, "Disconnected user sessions");
        ids.len()
    }

    /// Ask one session's task to close the connection.
    pub async fn close_session(&self, session_id: Uuid, code: u16, reason: &str) {
        if let Some(handle) = self.sessions.get(&session_id) {
            let _ = handle.outbound.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Cooperative shutdown: every session task closes its transport and
    /// cleans itself up.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        // Session tasks remove themselves; give them a scheduling quantum.
        for _ in 0..50 {
            if self.sessions.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<SessionInfo> {
        let ids: Vec<Uuid> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|handle| self.info_for(&handle))
            .collect()
    }

    pub fn stats(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            active_connections: self.sessions.len(),
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            rejected_auth: self.stats.rejected_auth.load(Ordering::Relaxed),
            rejected_capacity: self.stats.rejected_capacity.load(Ordering::Relaxed),
            closed_idle: self.stats.closed_idle.load(Ordering::Relaxed),
        }
    }

    fn info_for(&self, handle: &SessionHandle) -> SessionInfo {
        let mut subscribed: Vec<EventType> = handle
            .subscribed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect();
        subscribed.sort();
        SessionInfo {
            session_id: handle.id,
            user_id: handle.user_id.clone(),
            connection_type: handle.kind,
            connected_at: handle.connected_at,
            last_seen_at: *handle
                .last_seen
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            message_count: handle.message_count.load(Ordering::Relaxed),
            subscribed_event_types: subscribed,
        }
    }

    /// Enqueue a frame into a session mailbox and wait for the writer's
    /// outcome. Callers pass a cloned sender so no session-table lock is
    /// held across the await.
    async fn enqueue_with_ack(&self, outbound: mpsc::Sender<Outbound>, frame: Value) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        outbound
            .try_send(Outbound::Frame {
                frame,
                ack: Some(ack_tx),
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    BeaconError::transient_delivery("session mailbox full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    BeaconError::transient_delivery("session closed")
                }
            })?;
        ack_rx
            .await
            .map_err(|_| BeaconError::transient_delivery("session writer gone"))?
    }

    async fn run_session(self: Arc<Self>, task: SessionTask) {
        let SessionTask {
            session_id,
            user_id,
            mut sink,
            stream,
            mut outbound_rx,
            last_seen,
            message_count,
            subscribed,
            default_subscription_id,
        } = task;

        // Reader task: forwards inbound frames; a closed channel means the
        // peer hung up.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(32);
        let reader = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(text) = stream.recv().await {
                if inbound_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        let mut write_failures: u32 = 0;
        let mut ping_outstanding = false;
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close(CLOSE_NORMAL, REASON_SHUTDOWN).await;
                    break;
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound::Frame { frame, ack }) => {
                        let result = sink.send_text(frame.to_string()).await;
                        match &result {
                            Ok(()) => {
                                write_failures = 0;
                                message_count.fetch_add(1, Ordering::Relaxed);
                                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                write_failures += 1;
                                debug!(
                                    session_id = %session_id,
                                    failures = write_failures,
                                    error = %e,
                                    "Session write failed"
                                );
                            }
                        }
                        let failed = result.is_err();
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                        if failed && write_failures >= self.config.max_write_failures {
                            warn!(session_id = %session_id, "Persistent write failure, disconnecting session");
                            let _ = sink.close(CLOSE_TRY_AGAIN_LATER, "write failure").await;
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink.close(code, &reason).await;
                        break;
                    }
                    None => break,
                },
                inbound = inbound_rx.recv() => match inbound {
                    Some(text) => {
                        *last_seen.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Utc::now();
                        ping_outstanding = false;
                        self.handle_inbound(
                            session_id,
                            &user_id,
                            &mut sink,
                            &subscribed,
                            default_subscription_id,
                            &text,
                        )
                        .await;
                    }
                    None => {
                        debug!(session_id = %session_id, "Peer closed the connection");
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    let idle = Utc::now()
                        - *last_seen.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                    let idle = idle.to_std().unwrap_or_default();
                    if idle >= self.config.idle_close_after {
                        self.stats.closed_idle.fetch_add(1, Ordering::Relaxed);
                        info!(session_id = %session_id, "Closing idle session");
                        let _ = sink.close(CLOSE_NORMAL, REASON_IDLE).await;
                        break;
                    }
                    if idle >= self.config.idle_ping_after && !ping_outstanding {
                        ping_outstanding = true;
                        let ping = json!({
                            "type": "ping",
                            "data": {},
                            "timestamp": Utc::now(),
                        });
                        let _ = sink.send_text(ping.to_string()).await;
                    }
                }
            }
        }

        reader.abort();
        self.cleanup_session(session_id, &user_id).await;
    }

    async fn cleanup_session(&self, session_id: Uuid, user_id: &str) {
        self.sessions.remove(&session_id);
        if let Some(mut ids) = self.user_sessions.get_mut(user_id) {
            ids.remove(&session_id);
        }
        self.user_sessions
            .remove_if(user_id, |_, ids| ids.is_empty());
        if let Err(e) = self
            .subscriptions
            .drop_session_subscriptions(session_id)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to drop session subscriptions");
        }
        info!(session_id = %session_id, user_id, "Session closed");
    }

    async fn handle_inbound(
        &self,
        session_id: Uuid,
        user_id: &str,
        sink: &mut Box<dyn TransportSink>,
        subscribed: &Arc<RwLock<HashSet<EventType>>>,
        default_subscription_id: Uuid,
        text: &str,
    ) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.send_error(sink, "invalid_json", &format!("invalid JSON: {e}")).await;
                return;
            }
        };
        let message_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");
        let data = parsed.get("data").cloned().unwrap_or(Value::Null);

        match message_type {
            "ping" => {
                let pong = json!({
                    "type": "pong",
                    "data": { "timestamp": Utc::now() },
                    "timestamp": Utc::now(),
                });
                let _ = sink.send_text(pong.to_string()).await;
            }
            // answer to a server keepalive ping; the liveness bump already
            // happened when the frame arrived
            "pong" => {}
            "subscribe_events" => {
                self.handle_subscribe_events(sink, subscribed, default_subscription_id, &data)
                    .await;
            }
            "get_system_info" => {
                let frame = json!({
                    "type": "system_info",
                    "data": {
                        "session_id": session_id,
                        "active_connections": self.sessions.len(),
                        "max_connections": self.config.max_global,
                        "max_connections_per_user": self.config.max_per_user,
                        "features": {
                            "batching": true,
                            "compression": true,
                            "replay": true,
                            "critical_alerts": true,
                        },
                    },
                    "timestamp": Utc::now(),
                });
                let _ = sink.send_text(frame.to_string()).await;
            }
            "get_connection_stats" => {
                let stats = self.stats();
                let frame = json!({
                    "type": "connection_stats",
                    "data": {
                        "active_connections": stats.active_connections,
                        "total_connections": stats.total_connections,
                        "messages_sent": stats.messages_sent,
                        "frames_dropped": stats.frames_dropped,
                        "rejected_auth": stats.rejected_auth,
                        "rejected_capacity": stats.rejected_capacity,
                    },
                    "timestamp": Utc::now(),
                });
                let _ = sink.send_text(frame.to_string()).await;
            }
            "get_user_connections" => {
                let connections = self.sessions_for_user(user_id);
                let frame = json!({
                    "type": "user_connections",
                    "data": { "connections": connections },
                    "timestamp": Utc::now(),
                });
                let _ = sink.send_text(frame.to_string()).await;
            }
            other => {
                self.send_error(
                    sink,
                    "unknown_message_type",
                    &format!("unknown message type: {other}"),
                )
                .await;
            }
        }
    }

    async fn handle_subscribe_events(
        &self,
        sink: &mut Box<dyn TransportSink>,
        subscribed: &Arc<RwLock<HashSet<EventType>>>,
        default_subscription_id: Uuid,
        data: &Value,
    ) {
        let raw_types = data
            .get("event_types")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut event_types = Vec::with_capacity(raw_types.len());
        for raw in &raw_types {
            let Some(name) = raw.as_str() else {
                self.send_error(sink, "validation_error", "event_types must be strings").await;
                return;
            };
            match EventType::from_str(name) {
                Ok(event_type) => event_types.push(event_type),
                Err(_) => {
                    self.send_error(
                        sink,
                        "validation_error",
                        &format!("unknown event type: {name}"),
                    )
                    .await;
                    return;
                }
            }
        }

        if let Err(e) = self
            .subscriptions
            .update_session_subscription(default_subscription_id, event_types.clone())
            .await
        {
            self.send_error(sink, e.code(), &e.to_string()).await;
            return;
        }

        {
            let mut current = subscribed
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = event_types.iter().copied().collect();
        }

        let frame = json!({
            "type": "subscription_updated",
            "data": { "subscribed_event_types": event_types },
            "timestamp": Utc::now(),
        });
        let _ = sink.send_text(frame.to_string()).await;
    }

    async fn send_error(&self, sink: &mut Box<dyn TransportSink>, code: &str, message: &str) {
        let frame = json!({
            "type": "error",
            "data": { "code": code, "message": message },
            "timestamp": Utc::now(),
        });
        let _ = sink.send_text(frame.to_string()).await;
    }
}

struct SessionTask {
    session_id: Uuid,
    user_id: String,
    sink: Box<dyn TransportSink>,
    stream: Box<dyn TransportStream>,
    outbound_rx: mpsc::Receiver<Outbound>,
    last_seen: Arc<RwLock<DateTime<Utc>>>,
    message_count: Arc<AtomicU64>,
    subscribed: Arc<RwLock<HashSet<EventType>>>,
    default_subscription_id: Uuid,
}

#[async_trait]
impl SessionRouter for SessionManager {
    async fn send_to_user(&self, user_id: &str, frame: Value) -> Result<usize> {
        let ids: Vec<Uuid> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Err(BeaconError::transient_delivery(format!(
                "no active sessions for user {user_id}"
            )));
        }

        let mut written = 0usize;
        let mut last_error: Option<BeaconError> = None;
        for session_id in ids {
            let Some(outbound) = self
                .sessions
                .get(&session_id)
                .map(|handle| handle.outbound.clone())
            else {
                continue;
            };
            match self.enqueue_with_ack(outbound, frame.clone()).await {
                Ok(()) => written += 1,
                Err(e) => last_error = Some(e),
            }
        }

        if written == 0 {
            Err(last_error
                .unwrap_or_else(|| BeaconError::transient_delivery("all session writes failed")))
        } else {
            Ok(written)
        }
    }

    async fn send_to_session(&self, session_id: Uuid, frame: Value) -> Result<()> {
        let Some(outbound) = self
            .sessions
            .get(&session_id)
            .map(|handle| handle.outbound.clone())
        else {
            return Err(BeaconError::transient_delivery(format!(
                "session {session_id} not found"
            )));
        };
        self.enqueue_with_ack(outbound, frame).await
    }

    async fn broadcast(&self, frame: Value) -> Result<usize> {
        let mut written = 0usize;
        for handle in self.sessions.iter() {
            match handle.outbound.try_send(Outbound::Frame {
                frame: frame.clone(),
                ack: None,
            }) {
                Ok(()) => written += 1,
                Err(_) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(written)
    }
}
