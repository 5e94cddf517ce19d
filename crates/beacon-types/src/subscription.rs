//! Subscriptions: an owner-bound standing interest in a class of events.

use crate::event::Event;
use crate::filter::EventFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    /// When set, deliveries under this subscription target only this session.
    pub session_id: Option<Uuid>,
    pub filter: EventFilter,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(user_id: impl Into<String>, filter: EventFilter) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: None,
            filter,
            is_active: true,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Active and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|at| now < at).unwrap_or(true)
    }

    /// Whether this subscription accepts the event: live, filter match, and
    /// (when the event is targeted) owned by the target user.
    pub fn matches(&self, event: &Event, now: DateTime<Utc>) -> bool {
        if !self.is_live(now) {
            return false;
        }
        if let Some(target) = &event.target_user_id {
            if target != &self.user_id {
                return false;
            }
        }
        self.filter.matches(event)
    }
}

/// Partial update applied by the registry on behalf of the owner or an admin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub filter: Option<EventFilter>,
    pub is_active: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::EventType;
    use chrono::Duration;
    use serde_json::Map;

    #[test]
    fn liveness_gating() {
        let now = Utc::now();
        let mut sub = Subscription::new("u1", EventFilter::default());
        assert!(sub.is_live(now));

        sub.is_active = false;
        assert!(!sub.is_live(now));

        sub.is_active = true;
        sub.expires_at = Some(now - Duration::seconds(1));
        assert!(!sub.is_live(now));
    }

    #[test]
    fn targeted_events_only_match_the_target_owner() {
        let now = Utc::now();
        let sub = Subscription::new("u1", EventFilter::default());

        let broadcast = Event::new(EventType::HealthUpdate, Map::new());
        assert!(sub.matches(&broadcast, now));

        let for_u1 = Event::new(EventType::HealthUpdate, Map::new()).with_target_user("u1");
        assert!(sub.matches(&for_u1, now));

        let for_u2 = Event::new(EventType::HealthUpdate, Map::new()).with_target_user("u2");
        assert!(!sub.matches(&for_u2, now));
    }

    #[test]
    fn filter_still_applies_to_targeted_events() {
        let now = Utc::now();
        let sub = Subscription::new("u1", EventFilter::for_types(vec![EventType::ZoneCreated]));
        let event = Event::new(EventType::ZoneDeleted, Map::new()).with_target_user("u1");
        assert!(!sub.matches(&event, now));
    }
}
