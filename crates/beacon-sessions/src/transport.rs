//! Transport seam between the session manager and the wire. The axum
//! WebSocket adapter lives in [`crate::ws`]; the channel transport here
//! backs tests and in-process clients.
//!
//! A transport splits into a sink and a stream so the session task can own
//! the write half while a reader task drains the other.

use async_trait::async_trait;
use beacon_types::{BeaconError, Result};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

/// Write half of a session transport. One logical message = one frame.
#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection with an application-level code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of a session transport. Transport-level pings are answered
/// internally and never surface here.
#[async_trait]
pub trait TransportStream: Send {
    /// Next inbound text frame; `None` when the peer is gone.
    async fn recv(&mut self) -> Option<String>;
}

/// A bidirectional transport, consumed by the session manager at admission.
pub trait SessionTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

/// In-memory transport pair. The server side implements
/// [`SessionTransport`]; the [`ClientHandle`] plays the client.
pub struct ChannelTransport {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    close_tx: watch::Sender<Option<(u16, String)>>,
}

pub struct ChannelSink {
    to_client: mpsc::UnboundedSender<String>,
    close_tx: watch::Sender<Option<(u16, String)>>,
}

pub struct ChannelStream {
    from_client: mpsc::UnboundedReceiver<String>,
}

pub struct ClientHandle {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
    close_rx: watch::Receiver<Option<(u16, String)>>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ClientHandle) {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);
        (
            ChannelTransport {
                to_client,
                from_client,
                close_tx,
            },
            ClientHandle {
                to_server,
                from_server,
                close_rx,
            },
        )
    }
}

impl SessionTransport for ChannelTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (
            Box::new(ChannelSink {
                to_client: self.to_client,
                close_tx: self.close_tx,
            }),
            Box::new(ChannelStream {
                from_client: self.from_client,
            }),
        )
    }
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.to_client
            .send(text)
            .map_err(|_| BeaconError::transient_delivery("peer receiver dropped"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let _ = self.close_tx.send(Some((code, reason.to_string())));
        Ok(())
    }
}

#[async_trait]
impl TransportStream for ChannelStream {
    async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

impl ClientHandle {
    /// Send a JSON frame to the server side.
    pub fn send_json(&self, value: &Value) -> Result<()> {
        self.send_raw(&value.to_string())
    }

    /// Send raw text to the server side, JSON or not.
    pub fn send_raw(&self, text: &str) -> Result<()> {
        self.to_server
            .send(text.to_string())
            .map_err(|_| BeaconError::transient_delivery("server receiver dropped"))
    }

    /// Hang up from the client side.
    pub fn hang_up(self) {}

    /// Next frame written by the server, parsed as JSON.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let text = self.from_server.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Like [`Self::next_frame`] but gives up after the timeout.
    pub async fn next_frame_timeout(&mut self, timeout: std::time::Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.next_frame()).await.ok().flatten()
    }

    /// The close (code, reason) recorded by the server, if any.
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.close_rx.borrow().clone()
    }

    /// Wait until the server closes the connection.
    pub async fn wait_for_close(&mut self) -> Option<(u16, String)> {
        loop {
            if let Some(close) = self.close_rx.borrow().clone() {
                return Some(close);
            }
            if self.close_rx.changed().await.is_err() {
                return self.close_rx.borrow().clone();
            }
        }
    }
}
