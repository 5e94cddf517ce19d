//! The event model: an immutable, typed, timestamped record plus its routing
//! metadata. Payloads are opaque JSON maps; shape is validated only at the
//! boundary.

use crate::catalogue::{EventCategory, EventPriority, EventSeverity, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Context carried alongside every event for routing and tracing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub source_service: Option<String>,
    pub source_component: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
}

/// A single event as emitted by a producer and persisted/delivered by the
/// core. Serializes directly to the outbound wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub category: EventCategory,
    pub priority: EventPriority,
    pub severity: EventSeverity,
    pub data: Map<String, Value>,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub source_user_id: Option<String>,
    pub target_user_id: Option<String>,
    pub metadata: EventMetadata,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Event {
    /// Create an event with type-derived defaults: category from the
    /// catalogue map, priority/severity from the type's defaults.
    pub fn new(event_type: EventType, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            category: event_type.category(),
            priority: event_type.default_priority(),
            severity: event_type.default_severity(),
            data,
            created_at: Utc::now(),
            source_user_id: None,
            target_user_id: None,
            metadata: EventMetadata::default(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source_user(mut self, user_id: impl Into<String>) -> Self {
        self.source_user_id = Some(user_id.into());
        self
    }

    pub fn with_target_user(mut self, user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_source_service(mut self, service: impl Into<String>) -> Self {
        self.metadata.source_service = Some(service.into());
        self
    }

    pub fn with_source_component(mut self, component: impl Into<String>) -> Self {
        self.metadata.source_component = Some(component.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.metadata.tags.contains(&tag) {
            self.metadata.tags.push(tag);
        }
        self
    }

    pub fn with_custom_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.custom_fields.insert(key.into(), value);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Expired events are ineligible for delivery and retry.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Routing key for distribution: `category.type.priority`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}.{}", self.category, self.event_type, self.priority)
    }

    /// Outbound wire frame for this event.
    pub fn to_frame(&self) -> Value {
        // Serialization of a fully-owned value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_event_derives_category_and_defaults() {
        let event = Event::new(EventType::ZoneCreated, data(&[("zone", json!("example.com"))]));
        assert_eq!(event.category, EventCategory::Dns);
        assert_eq!(event.priority, EventPriority::Normal);
        assert_eq!(event.severity, EventSeverity::Info);
        assert_eq!(event.max_retries, 3);
        assert!(!event.is_expired());
        assert!(event.can_retry());
    }

    #[test]
    fn critical_type_defaults_to_critical_priority() {
        let event = Event::new(EventType::SecurityAlert, Map::new());
        assert_eq!(event.priority, EventPriority::Critical);
        assert_eq!(event.severity, EventSeverity::Critical);
    }

    #[test]
    fn frame_shape_matches_wire_contract() {
        let event = Event::new(EventType::HealthUpdate, data(&[("cpu", json!(42))]))
            .with_source_user("u1")
            .with_tag("probe");
        let frame = event.to_frame();

        assert_eq!(frame["type"], "health_update");
        assert_eq!(frame["category"], "health");
        assert_eq!(frame["priority"], "normal");
        assert_eq!(frame["data"]["cpu"], 42);
        assert_eq!(frame["source_user_id"], "u1");
        assert!(frame["target_user_id"].is_null());
        assert_eq!(frame["metadata"]["tags"][0], "probe");
        assert_eq!(frame["retry_count"], 0);
        assert_eq!(frame["max_retries"], 3);
        // chrono serializes DateTime<Utc> as RFC 3339 / ISO-8601
        assert!(frame["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let live = Event::new(EventType::HealthUpdate, Map::new())
            .with_expiry(Utc::now() + Duration::minutes(5));
        assert!(!live.is_expired());

        let dead = Event::new(EventType::HealthUpdate, Map::new())
            .with_expiry(Utc::now() - Duration::minutes(5));
        assert!(dead.is_expired());
    }

    #[test]
    fn routing_key_shape() {
        let event = Event::new(EventType::ZoneDeleted, Map::new());
        assert_eq!(event.routing_key(), "dns.zone_deleted.normal");
    }

    #[test]
    fn tags_deduplicate() {
        let event = Event::new(EventType::HealthUpdate, Map::new())
            .with_tag("a")
            .with_tag("a")
            .with_tag("b");
        assert_eq!(event.metadata.tags, vec!["a", "b"]);
    }
}
