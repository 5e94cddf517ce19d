//! Subscription registry: stores active subscriptions and answers "which
//! subscriptions match event E?".
//!
//! Matching is the hot path, so subscriptions are indexed by owner and by
//! their coarsest filter dimensions (event type, category). Expired entries
//! are skipped lazily during matching and swept periodically.

use async_trait::async_trait;
use beacon_persistence::SubscriptionStore;
use beacon_types::{
    BeaconError, Event, EventCategory, EventFilter, EventType, Result, Subscription,
    SubscriptionBackend, SubscriptionUpdate, UserDirectory,
};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often expired subscriptions are swept out of the indexes.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    directory: Arc<dyn UserDirectory>,
    config: RegistryConfig,
    by_id: DashMap<Uuid, Subscription>,
    by_user: DashMap<String, HashSet<Uuid>>,
    by_type: DashMap<EventType, HashSet<Uuid>>,
    by_category: DashMap<EventCategory, HashSet<Uuid>>,
    /// Subscriptions with neither a type nor a category constraint.
    unindexed: DashSet<Uuid>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        directory: Arc<dyn UserDirectory>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            directory,
            config,
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            by_type: DashMap::new(),
            by_category: DashMap::new(),
            unindexed: DashSet::new(),
        }
    }

    /// Rebuild the in-memory indexes from the store. Called once at startup.
    pub async fn load(&self) -> Result<usize> {
        let subscriptions = self.store.list_all_subscriptions().await?;
        let count = subscriptions.len();
        for subscription in subscriptions {
            self.index(&subscription);
            self.by_id.insert(subscription.id, subscription);
        }
        info!(count, "Subscription registry loaded");
        Ok(count)
    }

    /// Create a subscription for a user. The filter is validated before it
    /// is stored.
    pub async fn create(
        &self,
        user_id: &str,
        filter: EventFilter,
        session_id: Option<Uuid>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Uuid> {
        filter.validate()?;
        if let Some(expires_at) = expires_at {
            if expires_at <= Utc::now() {
                return Err(BeaconError::validation("expires_at must be in the future"));
            }
        }

        let mut subscription = Subscription::new(user_id, filter);
        subscription.session_id = session_id;
        subscription.expires_at = expires_at;

        self.store.store_subscription(&subscription).await?;
        self.index(&subscription);
        let id = subscription.id;
        self.by_id.insert(id, subscription);

        debug!(subscription_id = %id, user_id, "Subscription created");
        Ok(id)
    }

    /// Apply a partial update. Only the owner or an admin may touch a
    /// subscription.
    pub async fn update(
        &self,
        id: Uuid,
        update: SubscriptionUpdate,
        actor: &str,
    ) -> Result<Subscription> {
        let existing = self
            .by_id
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| BeaconError::not_found("subscription", id.to_string()))?;

        if existing.user_id != actor && !self.directory.is_admin(actor) {
            return Err(BeaconError::permission_denied(format!(
                "user {actor} does not own subscription {id}"
            )));
        }

        let mut updated = existing.clone();
        if let Some(filter) = update.filter {
            filter.validate()?;
            updated.filter = filter;
        }
        if let Some(is_active) = update.is_active {
            updated.is_active = is_active;
        }
        if let Some(expires_at) = update.expires_at {
            updated.expires_at = expires_at;
        }
        updated.updated_at = Utc::now();

        self.store.store_subscription(&updated).await?;
        self.unindex(&existing);
        self.index(&updated);
        self.by_id.insert(id, updated.clone());

        debug!(subscription_id = %id, actor, "Subscription updated");
        Ok(updated)
    }

    /// Delete a subscription. Idempotent: deleting an unknown id succeeds.
    pub async fn delete(&self, id: Uuid, actor: &str) -> Result<()> {
        let existing = match self.by_id.get(&id).map(|entry| entry.clone()) {
            Some(subscription) => subscription,
            None => return Ok(()),
        };

        if existing.user_id != actor && !self.directory.is_admin(actor) {
            return Err(BeaconError::permission_denied(format!(
                "user {actor} does not own subscription {id}"
            )));
        }

        self.store.delete_subscription(id).await?;
        self.unindex(&existing);
        self.by_id.remove(&id);
        debug!(subscription_id = %id, actor, "Subscription deleted");
        Ok(())
    }

    /// Active (live) subscriptions owned by a user.
    pub fn list_for_user(&self, user_id: &str) -> Vec<Subscription> {
        let now = Utc::now();
        let Some(ids) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|entry| entry.clone()))
            .filter(|subscription| subscription.is_live(now))
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<Subscription> {
        self.by_id.get(&id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All subscriptions matching the event. Candidates come from the
    /// type/category indexes (or the owner index for targeted events) so the
    /// work is proportional to plausible matches, not to the total count.
    pub fn match_event(&self, event: &Event) -> Vec<Subscription> {
        let now = Utc::now();
        let admin_only = event.event_type.is_admin_only();

        let candidate_ids: HashSet<Uuid> = match &event.target_user_id {
            Some(target) => self
                .by_user
                .get(target)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
            None => {
                let mut ids: HashSet<Uuid> = HashSet::new();
                if let Some(typed) = self.by_type.get(&event.event_type) {
                    ids.extend(typed.iter().copied());
                }
                if let Some(categorized) = self.by_category.get(&event.category) {
                    ids.extend(categorized.iter().copied());
                }
                ids.extend(self.unindexed.iter().map(|id| *id));
                ids
            }
        };

        candidate_ids
            .into_iter()
            .filter_map(|id| self.by_id.get(&id).map(|entry| entry.clone()))
            .filter(|subscription| {
                if admin_only && !self.directory.is_admin(&subscription.user_id) {
                    return false;
                }
                subscription.matches(event, now)
            })
            .collect()
    }

    /// Drop expired subscriptions from the indexes and the store.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let expired: Vec<Subscription> = self
            .by_id
            .iter()
            .filter(|entry| entry.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|entry| entry.clone())
            .collect();

        for subscription in &expired {
            self.unindex(subscription);
            self.by_id.remove(&subscription.id);
        }
        self.store.purge_expired_subscriptions(now).await?;

        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired subscriptions");
        }
        Ok(expired.len() as u64)
    }

    /// Spawn the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep_expired().await {
                            warn!(error = %e, "Subscription sweep failed");
                        }
                    }
                }
            }
        })
    }

    fn index(&self, subscription: &Subscription) {
        self.by_user
            .entry(subscription.user_id.clone())
            .or_default()
            .insert(subscription.id);

        if let Some(types) = &subscription.filter.event_types {
            for event_type in types {
                self.by_type.entry(*event_type).or_default().insert(subscription.id);
            }
        } else if let Some(categories) = &subscription.filter.event_categories {
            for category in categories {
                self.by_category
                    .entry(*category)
                    .or_default()
                    .insert(subscription.id);
            }
        } else {
            self.unindexed.insert(subscription.id);
        }
    }

    fn unindex(&self, subscription: &Subscription) {
        if let Some(mut ids) = self.by_user.get_mut(&subscription.user_id) {
            ids.remove(&subscription.id);
        }
        if let Some(types) = &subscription.filter.event_types {
            for event_type in types {
                if let Some(mut ids) = self.by_type.get_mut(event_type) {
                    ids.remove(&subscription.id);
                }
            }
        } else if let Some(categories) = &subscription.filter.event_categories {
            for category in categories {
                if let Some(mut ids) = self.by_category.get_mut(category) {
                    ids.remove(&subscription.id);
                }
            }
        } else {
            self.unindexed.remove(&subscription.id);
        }
    }
}

/// The session manager maintains kind-default subscriptions through this
/// seam without depending on the registry directly.
#[async_trait]
impl SubscriptionBackend for SubscriptionRegistry {
    async fn create_session_subscription(
        &self,
        user_id: &str,
        session_id: Uuid,
        event_types: Vec<EventType>,
    ) -> Result<Uuid> {
        self.create(user_id, EventFilter::for_types(event_types), Some(session_id), None)
            .await
    }

    async fn update_session_subscription(
        &self,
        subscription_id: Uuid,
        event_types: Vec<EventType>,
    ) -> Result<()> {
        let existing = self
            .by_id
            .get(&subscription_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| BeaconError::not_found("subscription", subscription_id.to_string()))?;

        let mut updated = existing.clone();
        updated.filter.event_types = Some(event_types);
        updated.updated_at = Utc::now();

        self.store.store_subscription(&updated).await?;
        self.unindex(&existing);
        self.index(&updated);
        self.by_id.insert(subscription_id, updated);
        Ok(())
    }

    async fn drop_session_subscriptions(&self, session_id: Uuid) -> Result<()> {
        let bound: Vec<Subscription> = self
            .by_id
            .iter()
            .filter(|entry| entry.session_id == Some(session_id))
            .map(|entry| entry.clone())
            .collect();

        for subscription in bound {
            self.store.delete_subscription(subscription.id).await?;
            self.unindex(&subscription);
            self.by_id.remove(&subscription.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_persistence::InMemoryRepository;
    use serde_json::Map;

    struct StaticDirectory {
        admins: Vec<String>,
    }

    impl UserDirectory for StaticDirectory {
        fn is_admin(&self, user_id: &str) -> bool {
            self.admins.iter().any(|admin| admin == user_id)
        }

        fn admin_user_ids(&self) -> Vec<String> {
            self.admins.clone()
        }
    }

    fn registry_with_admins(admins: &[&str]) -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(StaticDirectory {
                admins: admins.iter().map(|s| s.to_string()).collect(),
            }),
            RegistryConfig::default(),
        )
    }

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, Map::new())
    }

    #[tokio::test]
    async fn create_then_match_by_type_and_category() {
        let registry = registry_with_admins(&[]);
        let typed = registry
            .create("u1", EventFilter::for_types(vec![EventType::ZoneCreated]), None, None)
            .await
            .unwrap();
        let by_category = registry
            .create("u1", EventFilter::for_categories(vec![EventCategory::Dns]), None, None)
            .await
            .unwrap();
        registry
            .create("u1", EventFilter::for_types(vec![EventType::SecurityAlert]), None, None)
            .await
            .unwrap();

        let matched = registry.match_event(&event(EventType::ZoneCreated));
        let ids: Vec<Uuid> = matched.iter().map(|s| s.id).collect();
        assert_eq!(matched.len(), 2);
        assert!(ids.contains(&typed));
        assert!(ids.contains(&by_category));
    }

    #[tokio::test]
    async fn unconstrained_subscription_matches_everything() {
        let registry = registry_with_admins(&[]);
        registry
            .create("u1", EventFilter::default(), None, None)
            .await
            .unwrap();
        assert_eq!(registry.match_event(&event(EventType::HealthUpdate)).len(), 1);
        assert_eq!(registry.match_event(&event(EventType::AuditLog)).len(), 0); // admin-only
    }

    #[tokio::test]
    async fn targeted_events_only_reach_target_owner() {
        let registry = registry_with_admins(&[]);
        registry
            .create("u1", EventFilter::default(), None, None)
            .await
            .unwrap();
        registry
            .create("u2", EventFilter::default(), None, None)
            .await
            .unwrap();

        let targeted = event(EventType::HealthUpdate).with_target_user("u2");
        let matched = registry.match_event(&targeted);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].user_id, "u2");
    }

    #[tokio::test]
    async fn admin_only_events_skip_non_admin_subscribers() {
        let registry = registry_with_admins(&["root"]);
        registry
            .create("u1", EventFilter::for_types(vec![EventType::UserCreated]), None, None)
            .await
            .unwrap();
        registry
            .create("root", EventFilter::for_types(vec![EventType::UserCreated]), None, None)
            .await
            .unwrap();

        let matched = registry.match_event(&event(EventType::UserCreated));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].user_id, "root");
    }

    #[tokio::test]
    async fn update_requires_owner_or_admin() {
        let registry = registry_with_admins(&["root"]);
        let id = registry
            .create("u1", EventFilter::default(), None, None)
            .await
            .unwrap();

        let deactivate = SubscriptionUpdate {
            is_active: Some(false),
            ..Default::default()
        };
        let denied = registry.update(id, deactivate.clone(), "u2").await;
        assert!(matches!(denied, Err(BeaconError::PermissionDenied { .. })));

        let updated = registry.update(id, deactivate, "root").await.unwrap();
        assert!(!updated.is_active);
        assert!(registry.match_event(&event(EventType::HealthUpdate)).is_empty());
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let registry = registry_with_admins(&[]);
        let result = registry
            .update(Uuid::new_v4(), SubscriptionUpdate::default(), "u1")
            .await;
        assert!(matches!(result, Err(BeaconError::NotFound { .. })));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_future_matches() {
        let registry = registry_with_admins(&[]);
        let id = registry
            .create("u1", EventFilter::default(), None, None)
            .await
            .unwrap();

        registry.delete(id, "u1").await.unwrap();
        assert!(registry.match_event(&event(EventType::HealthUpdate)).is_empty());
        // second delete is a no-op
        registry.delete(id, "u1").await.unwrap();
    }

    #[tokio::test]
    async fn expired_subscriptions_are_lazily_skipped_and_swept() {
        let registry = registry_with_admins(&[]);
        registry
            .create(
                "u1",
                EventFilter::default(),
                None,
                Some(Utc::now() + chrono::Duration::milliseconds(5)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.match_event(&event(EventType::HealthUpdate)).is_empty());

        let swept = registry.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn session_subscription_lifecycle() {
        let registry = registry_with_admins(&[]);
        let session_id = Uuid::new_v4();
        let sub_id = registry
            .create_session_subscription("u1", session_id, vec![EventType::HealthUpdate])
            .await
            .unwrap();

        assert_eq!(registry.match_event(&event(EventType::HealthUpdate)).len(), 1);
        assert!(registry.match_event(&event(EventType::ZoneCreated)).is_empty());

        registry
            .update_session_subscription(sub_id, vec![EventType::ZoneCreated])
            .await
            .unwrap();
        assert!(registry.match_event(&event(EventType::HealthUpdate)).is_empty());
        assert_eq!(registry.match_event(&event(EventType::ZoneCreated)).len(), 1);

        registry.drop_session_subscriptions(session_id).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn load_rebuilds_indexes_from_store() {
        let store = Arc::new(InMemoryRepository::new());
        let subscription =
            Subscription::new("u1", EventFilter::for_types(vec![EventType::ZoneCreated]));
        store.store_subscription(&subscription).await.unwrap();

        let registry = SubscriptionRegistry::new(
            store,
            Arc::new(StaticDirectory { admins: vec![] }),
            RegistryConfig::default(),
        );
        assert_eq!(registry.load().await.unwrap(), 1);
        assert_eq!(registry.match_event(&event(EventType::ZoneCreated)).len(), 1);
    }
}
