//! Session kinds, configuration and close codes.

use beacon_types::{EventCategory, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Application-level close codes and reasons. The codes are stable; clients
/// key reconnect behaviour off them.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub const REASON_AUTH_REQUIRED: &str = "Authentication token required";
pub const REASON_INVALID_KIND: &str = "Invalid connection type";
pub const REASON_TOO_MANY_FOR_USER: &str = "Too many connections for this user";
pub const REASON_OVERLOADED: &str = "Server overloaded - too many connections";
pub const REASON_IDLE: &str = "idle";
pub const REASON_SHUTDOWN: &str = "server shutting down";

/// Connection kind. Each kind implies a default set of subscribed event
/// types, materialized as the session's default subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Unified,
    Health,
    DnsManagement,
    Security,
    System,
    Admin,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Unified => "unified",
            SessionKind::Health => "health",
            SessionKind::DnsManagement => "dns_management",
            SessionKind::Security => "security",
            SessionKind::System => "system",
            SessionKind::Admin => "admin",
        }
    }

    /// The event types a session of this kind is subscribed to by default.
    pub fn default_event_types(&self) -> Vec<EventType> {
        match self {
            SessionKind::Unified => types_in_categories(&[
                EventCategory::Health,
                EventCategory::Dns,
                EventCategory::Security,
                EventCategory::BulkOperation,
                EventCategory::Error,
                EventCategory::Connection,
            ]),
            SessionKind::Health => types_in_categories(&[EventCategory::Health, EventCategory::Connection]),
            SessionKind::DnsManagement => {
                types_in_categories(&[EventCategory::Dns, EventCategory::Connection])
            }
            SessionKind::Security => {
                types_in_categories(&[EventCategory::Security, EventCategory::Connection])
            }
            SessionKind::System => {
                types_in_categories(&[EventCategory::System, EventCategory::Connection])
            }
            SessionKind::Admin => EventType::ALL.to_vec(),
        }
    }
}

fn types_in_categories(categories: &[EventCategory]) -> Vec<EventType> {
    EventType::ALL
        .iter()
        .filter(|event_type| categories.contains(&event_type.category()))
        .copied()
        .collect()
}

impl FromStr for SessionKind {
    type Err = beacon_types::BeaconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unified" => Ok(SessionKind::Unified),
            "health" => Ok(SessionKind::Health),
            "dns_management" => Ok(SessionKind::DnsManagement),
            "security" => Ok(SessionKind::Security),
            "system" => Ok(SessionKind::System),
            "admin" => Ok(SessionKind::Admin),
            other => Err(beacon_types::BeaconError::validation(format!(
                "unknown connection type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_per_user: usize,
    pub max_global: usize,
    /// Bound on each session's outbound mailbox.
    pub outbound_buffer: usize,
    /// No inbound frame for this long triggers a server ping.
    pub idle_ping_after: Duration,
    /// No inbound frame for this long closes the session.
    pub idle_close_after: Duration,
    /// Cadence of the keepalive check inside each session task.
    pub keepalive_interval: Duration,
    /// Consecutive write failures before the session is disconnected.
    pub max_write_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_per_user: 10,
            max_global: 500,
            outbound_buffer: 256,
            idle_ping_after: Duration::from_secs(300),
            idle_close_after: Duration::from_secs(600),
            keepalive_interval: Duration::from_secs(30),
            max_write_failures: 3,
        }
    }
}

impl SessionConfig {
    /// Environment-driven overrides, used by the composition root.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_usize("BEACON_MAX_CONNECTIONS_PER_USER") {
            config.max_per_user = value;
        }
        if let Some(value) = env_usize("BEACON_MAX_CONNECTIONS") {
            config.max_global = value;
        }
        if let Some(value) = env_usize("BEACON_SESSION_OUTBOUND_BUFFER") {
            config.outbound_buffer = value;
        }
        if let Some(secs) = env_usize("BEACON_IDLE_PING_SECS") {
            config.idle_ping_after = Duration::from_secs(secs as u64);
        }
        if let Some(secs) = env_usize("BEACON_IDLE_CLOSE_SECS") {
            config.idle_close_after = Duration::from_secs(secs as u64);
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

/// Point-in-time view of one session, as returned by
/// `get_user_connections`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: String,
    pub connection_type: SessionKind,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub message_count: u64,
    pub subscribed_event_types: Vec<EventType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for kind in [
            SessionKind::Unified,
            SessionKind::Health,
            SessionKind::DnsManagement,
            SessionKind::Security,
            SessionKind::System,
            SessionKind::Admin,
        ] {
            assert_eq!(kind.as_str().parse::<SessionKind>().unwrap(), kind);
        }
        assert!("browser".parse::<SessionKind>().is_err());
    }

    #[test]
    fn default_event_sets_track_categories() {
        let health = SessionKind::Health.default_event_types();
        assert!(health.contains(&EventType::HealthAlert));
        assert!(health.contains(&EventType::Ping));
        assert!(!health.contains(&EventType::ZoneCreated));

        let dns = SessionKind::DnsManagement.default_event_types();
        assert!(dns.contains(&EventType::ZoneCreated));
        assert!(!dns.contains(&EventType::SecurityAlert));

        let admin = SessionKind::Admin.default_event_types();
        assert_eq!(admin.len(), EventType::ALL.len());
        assert!(admin.contains(&EventType::AuditLog));
    }

    #[test]
    fn default_caps() {
        let config = SessionConfig::default();
        assert_eq!(config.max_per_user, 10);
        assert_eq!(config.max_global, 500);
        assert!(config.idle_ping_after < config.idle_close_after);
    }
}
