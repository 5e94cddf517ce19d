//! Cross-crate trait contracts. Each subsystem crate depends on these
//! instead of on its peers; the composition root wires the concrete
//! implementations together.

use crate::errors::Result;
use crate::event::Event;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// A delivery target: a user, optionally narrowed to one of their sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub user_id: String,
    pub session_id: Option<Uuid>,
}

impl Recipient {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
        }
    }

    pub fn session(user_id: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: Some(session_id),
        }
    }
}

/// Routes outbound frames into session writer loops. Implemented by the
/// session manager; every write for a given session funnels through that
/// session's single writer, which is what preserves per-session order.
#[async_trait]
pub trait SessionRouter: Send + Sync {
    /// Write a frame to every open session of a user. Returns the number of
    /// sessions written; zero open sessions is a transient delivery error.
    async fn send_to_user(&self, user_id: &str, frame: Value) -> Result<usize>;

    /// Write a frame to one specific session.
    async fn send_to_session(&self, session_id: Uuid, frame: Value) -> Result<()>;

    /// Write a frame to every open session.
    async fn broadcast(&self, frame: Value) -> Result<usize>;
}

/// Directory facts the core needs about users. Token issuance and user
/// management live outside the core.
pub trait UserDirectory: Send + Sync {
    fn is_admin(&self, user_id: &str) -> bool;

    fn admin_user_ids(&self) -> Vec<String>;
}

/// Verified identity attached to a session at admission.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub is_admin: bool,
}

/// Session-token verification, supplied by the surrounding service.
pub trait AuthProvider: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Accepts per-recipient messages for batched delivery. Implemented by the
/// message batcher.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Queue an event for the recipient (`None` = broadcast). Returns `true`
    /// if the event was queued, `false` if it bypassed batching and was sent
    /// immediately. `delivery_ids` are reported to the delivery reporter
    /// once the enclosing batch is flushed.
    async fn add(
        &self,
        event: &Event,
        recipient: Option<Recipient>,
        delivery_ids: Vec<Uuid>,
    ) -> Result<bool>;
}

/// Receives flush outcomes for tracked deliveries. Implemented by the
/// delivery tracker.
#[async_trait]
pub trait DeliveryReporter: Send + Sync {
    async fn report_success(&self, delivery_ids: &[Uuid]);

    async fn report_failure(&self, delivery_ids: &[Uuid], error: &str);
}

/// Session-default subscription maintenance, implemented by the
/// subscription registry. Lets the session manager materialize the default
/// subscription implied by a session's kind without depending on the
/// registry crate.
#[async_trait]
pub trait SubscriptionBackend: Send + Sync {
    /// Create the kind-default subscription for a newly admitted session.
    async fn create_session_subscription(
        &self,
        user_id: &str,
        session_id: Uuid,
        event_types: Vec<crate::catalogue::EventType>,
    ) -> Result<Uuid>;

    /// Replace the event-type membership of a session's default
    /// subscription (the `subscribe_events` control message).
    async fn update_session_subscription(
        &self,
        subscription_id: Uuid,
        event_types: Vec<crate::catalogue::EventType>,
    ) -> Result<()>;

    /// Drop every subscription bound to a closing session.
    async fn drop_session_subscriptions(&self, session_id: Uuid) -> Result<()>;
}
