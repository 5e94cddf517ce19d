//! Delivery attempt records and their status machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the delivery is transported. Only in-process session push exists
/// today; webhook/email are extension points, not code paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Session,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

/// One (event, subscription) delivery and its attempt bookkeeping.
///
/// Transitions: pending → {delivered | failed | retrying};
/// retrying → {delivered | failed | retrying} until `attempts ==
/// max_attempts`, which is terminal failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: String,
    pub session_id: Option<Uuid>,
    pub method: DeliveryMethod,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Earliest wall-clock time the next attempt may run.
    pub retry_after: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl DeliveryRecord {
    pub fn new(event_id: Uuid, subscription_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            subscription_id,
            user_id: user_id.into(),
            session_id: None,
            method: DeliveryMethod::Session,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            created_at: Utc::now(),
            last_attempt_at: None,
            delivered_at: None,
            failed_at: None,
            retry_after: None,
            error_message: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Record a successful attempt.
    pub fn record_success(&mut self) {
        let now = Utc::now();
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.status = DeliveryStatus::Delivered;
        self.delivered_at = Some(now);
        self.retry_after = None;
        self.error_message = None;
    }

    /// Record a failed attempt. Schedules a retry at `base_backoff ×
    /// attempts` until the attempt budget is exhausted, then goes terminal.
    pub fn record_failure(&mut self, error: impl Into<String>, base_backoff: Duration) {
        let now = Utc::now();
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.error_message = Some(error.into());

        if self.attempts >= self.max_attempts {
            self.status = DeliveryStatus::Failed;
            self.failed_at = Some(now);
            self.retry_after = None;
        } else {
            self.status = DeliveryStatus::Retrying;
            self.retry_after = Some(now + base_backoff * self.attempts as i32);
        }
    }

    /// Force the record terminal without consuming an attempt, e.g. when the
    /// underlying event expired before the next retry.
    pub fn mark_expired(&mut self, reason: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.retry_after = None;
        self.error_message = Some(reason.into());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }

    /// Whether the retry sweeper should pick this record up now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Retrying
            && self.attempts < self.max_attempts
            && self.retry_after.map(|at| at <= now).unwrap_or(true)
    }
}
