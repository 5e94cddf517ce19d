//! The thin WebSocket surface over the core. Everything here translates
//! straight into core operations; no business logic lives at this layer.

use crate::core::AppCore;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use beacon_sessions::transport::SessionTransport;
use beacon_sessions::types::{CLOSE_POLICY_VIOLATION, REASON_INVALID_KIND};
use beacon_sessions::ws::WsTransport;
use beacon_sessions::SessionKind;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub fn router(app: Arc<AppCore>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .with_state(app)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    connection_type: Option<String>,
}

async fn ws_handler(
    State(app): State<Arc<AppCore>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(WsTransport::new(socket));
        let kind_raw = query.connection_type.as_deref().unwrap_or("unified");
        let kind: SessionKind = match kind_raw.parse() {
            Ok(kind) => kind,
            Err(_) => {
                let (mut sink, _stream) = transport.split();
                let _ = sink.close(CLOSE_POLICY_VIOLATION, REASON_INVALID_KIND).await;
                return;
            }
        };
        let token = query.token.unwrap_or_default();
        if let Err(e) = app.sessions().connect(transport, &token, kind).await {
            debug!(error = %e, connection_type = kind_raw, "WebSocket admission rejected");
        }
    })
}

async fn health_handler(State(app): State<Arc<AppCore>>) -> impl IntoResponse {
    let bus = app.bus().stats();
    let sessions = app.sessions().stats();
    Json(json!({
        "status": "ok",
        "bus": {
            "emitted": bus.emitted,
            "filtered": bus.filtered,
            "queue_depth": bus.queue_depth,
            "deliveries_created": bus.deliveries_created,
        },
        "sessions": {
            "active": sessions.active_connections,
            "total": sessions.total_connections,
            "messages_sent": sessions.messages_sent,
        },
        "timestamp": chrono::Utc::now(),
    }))
}
