//! Bidirectional client sessions and per-recipient message batching.
//!
//! The session manager owns admission (auth, caps), a single writer task per
//! session (the only place preserving outbound order), the inbound control
//! channel and keepalive. The batcher amortises transport cost with
//! time+size batching, adaptive sizing, gzip compression and a priority
//! bypass for critical traffic.

pub mod batcher;
pub mod compress;
pub mod manager;
pub mod transport;
pub mod types;
pub mod ws;

pub use batcher::{BatcherConfig, BatcherMetricsSnapshot, BatchingStrategy, MessageBatcher};
pub use manager::{ManagerStatsSnapshot, SessionManager};
pub use transport::{ChannelTransport, ClientHandle, SessionTransport};
pub use types::{SessionConfig, SessionInfo, SessionKind};
