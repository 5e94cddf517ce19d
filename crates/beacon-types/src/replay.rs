//! Replay sessions: re-emission of persisted history to its owner at a
//! requested time scale.

use crate::filter::EventFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_REPLAY_SPEED: u32 = 10;
pub const MAX_REPLAY_RANGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ReplayStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplayStatus::Completed | ReplayStatus::Failed | ReplayStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySession {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub filter: EventFilter,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub speed_multiplier: u32,
    pub status: ReplayStatus,
    /// Whole percentage, monotonic non-decreasing.
    pub progress: u8,
    pub total_events: u64,
    pub processed_events: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ReplaySession {
    pub fn new(
        name: impl Into<String>,
        user_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        filter: EventFilter,
        speed_multiplier: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            description: None,
            filter,
            start_time,
            end_time,
            speed_multiplier,
            status: ReplayStatus::Pending,
            progress: 0,
            total_events: 0,
            processed_events: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = ReplayStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn update_progress(&mut self, processed: u64) {
        self.processed_events = processed.min(self.total_events);
        let pct = if self.total_events == 0 {
            100
        } else {
            ((self.processed_events * 100) / self.total_events) as u8
        };
        // monotonic non-decreasing
        if pct > self.progress {
            self.progress = pct;
        }
    }

    pub fn mark_completed(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ReplayStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress = 100;
    }

    pub fn mark_cancelled(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ReplayStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ReplayStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> ReplaySession {
        let start = Utc::now() - Duration::hours(2);
        ReplaySession::new(
            "last-two-hours",
            "u1",
            start,
            start + Duration::hours(1),
            EventFilter::default(),
            2,
        )
    }

    #[test]
    fn progress_is_monotonic() {
        let mut replay = session();
        replay.total_events = 200;

        replay.update_progress(50);
        assert_eq!(replay.progress, 25);
        replay.update_progress(100);
        assert_eq!(replay.progress, 50);
        // stale update cannot move progress backwards
        replay.update_progress(60);
        assert_eq!(replay.progress, 50);
        assert_eq!(replay.processed_events, 60);
    }

    #[test]
    fn processed_is_capped_by_total() {
        let mut replay = session();
        replay.total_events = 10;
        replay.update_progress(50);
        assert_eq!(replay.processed_events, 10);
        assert_eq!(replay.progress, 100);
    }

    #[test]
    fn only_one_terminal_transition() {
        let mut replay = session();
        replay.mark_running();
        replay.mark_cancelled();
        assert_eq!(replay.status, ReplayStatus::Cancelled);
        let completed_at = replay.completed_at;

        replay.mark_completed();
        replay.mark_failed("late error");
        assert_eq!(replay.status, ReplayStatus::Cancelled);
        assert_eq!(replay.completed_at, completed_at);
        assert!(replay.error_message.is_none());
    }

    #[test]
    fn empty_replay_reports_full_progress() {
        let mut replay = session();
        replay.total_events = 0;
        replay.update_progress(0);
        assert_eq!(replay.progress, 100);
    }
}
