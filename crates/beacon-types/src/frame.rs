//! Batch frames for grouped delivery to a single recipient.

use crate::catalogue::EventPriority;
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

/// A group of events destined for one recipient, sent as a single transport
/// frame. Batch priority tracks the highest-priority event it holds.
#[derive(Debug, Clone)]
pub struct BatchedMessage {
    pub id: Uuid,
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    pub priority: EventPriority,
    pub compressed: bool,
    pub compression_ratio: Option<f64>,
}

impl Default for BatchedMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchedMessage {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            events: Vec::new(),
            created_at: Utc::now(),
            priority: EventPriority::Normal,
            compressed: false,
            compression_ratio: None,
        }
    }

    /// Append an event, promoting the batch priority when the event outranks
    /// the current one.
    pub fn add_event(&mut self, event: Event) {
        if event.priority > self.priority {
            self.priority = event.priority;
        }
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Approximate serialized size of the batch frame in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_string(&self.to_frame()).map(|s| s.len()).unwrap_or(0)
    }

    /// Whether the batch has reached either the count or byte bound.
    pub fn is_full(&self, max_count: usize, max_bytes: usize) -> bool {
        self.events.len() >= max_count || self.size_bytes() >= max_bytes
    }

    /// Batches holding a critical or urgent event are flushed immediately.
    pub fn should_send_immediately(&self) -> bool {
        self.events.iter().any(|event| event.priority.is_immediate())
    }

    /// Outbound wire frame: `{"type": "batched_events", ...}`.
    pub fn to_frame(&self) -> Value {
        json!({
            "id": self.id,
            "type": "batched_events",
            "batch_size": self.events.len(),
            "priority": self.priority,
            "compressed": self.compressed,
            "compression_ratio": self.compression_ratio,
            "created_at": self.created_at,
            "events": self.events.iter().map(Event::to_frame).collect::<Vec<_>>(),
        })
    }
}
