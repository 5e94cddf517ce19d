//! axum WebSocket adapter for the session transport seam.

use crate::transport::{SessionTransport, TransportSink, TransportStream};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use beacon_types::{BeaconError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

/// Wraps an upgraded axum WebSocket as a [`SessionTransport`].
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl SessionTransport for WsTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        let (sink, stream) = self.socket.split();
        (Box::new(WsSink { sink }), Box::new(WsStream { stream }))
    }
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

pub struct WsStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| BeaconError::transient_delivery(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| BeaconError::transient_delivery(format!("websocket close failed: {e}")))
    }
}

#[async_trait]
impl TransportStream for WsStream {
    async fn recv(&mut self) -> Option<String> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                // Binary frames are reserved for future compressed inbound
                // payloads; the control vocabulary is text-only today.
                Ok(Message::Binary(data)) => {
                    debug!(size = data.len(), "Ignoring binary WebSocket frame");
                }
                // axum answers pings itself; pongs just refresh liveness
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!(error = %e, "WebSocket receive error");
                    return None;
                }
            }
        }
        None
    }
}
