//! Repository trait contracts. One trait per entity family; [`Repository`]
//! bundles them for components that need several. Transactions never span
//! more than one entity write.

use async_trait::async_trait;
use beacon_types::{
    DeliveryRecord, DeliveryStatus, Event, EventCategory, EventFilter, EventSeverity, EventType,
    ReplaySession, Result, Subscription,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Range/filter query over persisted events. Results are always ordered
/// ascending by `created_at`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub event_types: Option<Vec<EventType>>,
    pub categories: Option<Vec<EventCategory>>,
    pub severities: Option<Vec<EventSeverity>>,
    pub source_user_id: Option<String>,
    /// Full filter semantics on top of the coarse columns above.
    pub filter: Option<EventFilter>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(start) = self.start_time {
            if event.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.created_at > end {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            if !categories.contains(&event.category) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&event.severity) {
                return false;
            }
        }
        if let Some(user_id) = &self.source_user_id {
            if event.source_user_id.as_ref() != Some(user_id) {
                return false;
            }
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(event) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store_event(&self, event: &Event) -> Result<()>;

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;

    /// Matching events, ascending by `created_at`.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>>;

    async fn count_events(&self, query: &EventQuery) -> Result<u64>;

    /// Delete events created before the cutoff. Returns how many went.
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or replace by id.
    async fn store_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>>;

    async fn delete_subscription(&self, id: Uuid) -> Result<()>;

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    /// Every stored subscription; used to rebuild registry indexes on start.
    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Delete subscriptions whose expiry has passed. Returns how many went.
    async fn purge_expired_subscriptions(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert or replace by id.
    async fn store_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<DeliveryRecord>>;

    /// Every delivery record for one event.
    async fn list_deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<DeliveryRecord>>;

    /// Retrying records whose `retry_after` has passed, oldest first.
    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryRecord>>;

    async fn count_deliveries_by_status(&self, status: DeliveryStatus) -> Result<u64>;

    /// Delete terminal records created before the cutoff.
    async fn purge_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Insert or replace by id.
    async fn store_replay(&self, replay: &ReplaySession) -> Result<()>;

    async fn get_replay(&self, id: Uuid) -> Result<Option<ReplaySession>>;

    async fn list_replays_for_user(&self, user_id: &str) -> Result<Vec<ReplaySession>>;
}

/// The full storage contract the composition root hands to components.
pub trait Repository: EventStore + SubscriptionStore + DeliveryStore + ReplayStore {}

impl<T> Repository for T where T: EventStore + SubscriptionStore + DeliveryStore + ReplayStore {}
