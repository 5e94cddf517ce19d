//! In-memory repository. Backs tests and single-process deployments; a
//! SQL-backed implementation plugs in behind the same traits.

use crate::repository::{DeliveryStore, EventQuery, EventStore, ReplayStore, SubscriptionStore};
use async_trait::async_trait;
use beacon_types::{
    DeliveryRecord, DeliveryStatus, Event, ReplaySession, Result, Subscription,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryRepository {
    events: DashMap<Uuid, Event>,
    subscriptions: DashMap<Uuid, Subscription>,
    deliveries: DashMap<Uuid, DeliveryRecord>,
    replays: DashMap<Uuid, ReplaySession>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }
}

#[async_trait]
impl EventStore for InMemoryRepository {
    async fn store_event(&self, event: &Event) -> Result<()> {
        self.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.get(&id).map(|entry| entry.clone()))
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut matches: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| query.accepts(entry.value()))
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by_key(|event| event.created_at);
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn count_events(&self, query: &EventQuery) -> Result<u64> {
        Ok(self
            .events
            .iter()
            .filter(|entry| query.accepts(entry.value()))
            .count() as u64)
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.events.len();
        self.events.retain(|_, event| event.created_at >= cutoff);
        Ok((before - self.events.len()) as u64)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryRepository {
    async fn store_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(&id).map(|entry| entry.clone()))
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<()> {
        self.subscriptions.remove(&id);
        Ok(())
    }

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.iter().map(|entry| entry.clone()).collect())
    }

    async fn purge_expired_subscriptions(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, sub| sub.expires_at.map(|at| at > now).unwrap_or(true));
        Ok((before - self.subscriptions.len()) as u64)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryRepository {
    async fn store_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.deliveries.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<DeliveryRecord>> {
        Ok(self.deliveries.get(&id).map(|entry| entry.clone()))
    }

    async fn list_deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .deliveries
            .iter()
            .filter(|entry| entry.event_id == event_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let mut due: Vec<DeliveryRecord> = self
            .deliveries
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| entry.clone())
            .collect();
        due.sort_by_key(|record| record.retry_after);
        due.truncate(limit);
        Ok(due)
    }

    async fn count_deliveries_by_status(&self, status: DeliveryStatus) -> Result<u64> {
        Ok(self
            .deliveries
            .iter()
            .filter(|entry| entry.status == status)
            .count() as u64)
    }

    async fn purge_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.deliveries.len();
        self.deliveries
            .retain(|_, record| !(record.is_terminal() && record.created_at < cutoff));
        Ok((before - self.deliveries.len()) as u64)
    }
}

#[async_trait]
impl ReplayStore for InMemoryRepository {
    async fn store_replay(&self, replay: &ReplaySession) -> Result<()> {
        self.replays.insert(replay.id, replay.clone());
        Ok(())
    }

    async fn get_replay(&self, id: Uuid) -> Result<Option<ReplaySession>> {
        Ok(self.replays.get(&id).map(|entry| entry.clone()))
    }

    async fn list_replays_for_user(&self, user_id: &str) -> Result<Vec<ReplaySession>> {
        Ok(self
            .replays
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect())
    }
}
