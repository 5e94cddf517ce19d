//! Critical event rules and the escalation ladder.

use beacon_types::{Event, EventCategory, EventPriority, EventSeverity, EventType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Escalation ladder. L1 is the immediate notification; later levels fire
/// at deadline multiples of the rule's escalation timeout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    Level1,
    Level2,
    Level3,
    Level4,
}

impl EscalationLevel {
    pub fn next(&self) -> EscalationLevel {
        match self {
            EscalationLevel::None => EscalationLevel::Level1,
            EscalationLevel::Level1 => EscalationLevel::Level2,
            EscalationLevel::Level2 => EscalationLevel::Level3,
            EscalationLevel::Level3 => EscalationLevel::Level4,
            EscalationLevel::Level4 => EscalationLevel::Level4,
        }
    }
}

/// Delivery channels. Only the in-process session channel exists; other
/// channels are an extension point for the surrounding service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Session,
}

/// One rule in the critical track. Empty constraint sets are "don't care";
/// rules are evaluated in registration order and every match produces a
/// notification.
#[derive(Debug, Clone)]
pub struct CriticalEventRule {
    pub id: String,
    pub name: String,
    pub event_types: HashSet<EventType>,
    pub event_categories: HashSet<EventCategory>,
    pub severities: HashSet<EventSeverity>,
    pub priorities: HashSet<EventPriority>,
    pub escalation_enabled: bool,
    pub escalation_timeout: Duration,
    pub max_escalation_level: EscalationLevel,
    pub channels: HashSet<NotificationChannel>,
    /// `None` targets every admin user.
    pub target_users: Option<HashSet<String>>,
    pub enabled: bool,
}

impl CriticalEventRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            event_types: HashSet::new(),
            event_categories: HashSet::new(),
            severities: HashSet::new(),
            priorities: HashSet::new(),
            escalation_enabled: true,
            escalation_timeout: Duration::from_secs(300),
            max_escalation_level: EscalationLevel::Level3,
            channels: [NotificationChannel::Session].into_iter().collect(),
            target_users: None,
            enabled: true,
        }
    }

    pub fn with_types(mut self, event_types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = event_types.into_iter().collect();
        self
    }

    pub fn with_categories(
        mut self,
        categories: impl IntoIterator<Item = EventCategory>,
    ) -> Self {
        self.event_categories = categories.into_iter().collect();
        self
    }

    pub fn with_priorities(
        mut self,
        priorities: impl IntoIterator<Item = EventPriority>,
    ) -> Self {
        self.priorities = priorities.into_iter().collect();
        self
    }

    pub fn with_escalation(mut self, timeout: Duration, max_level: EscalationLevel) -> Self {
        self.escalation_timeout = timeout;
        self.max_escalation_level = max_level;
        self
    }

    pub fn with_targets(mut self, users: impl IntoIterator<Item = String>) -> Self {
        self.target_users = Some(users.into_iter().collect());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.event_categories.is_empty() && !self.event_categories.contains(&event.category) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&event.severity) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&event.priority) {
            return false;
        }
        true
    }
}

/// The stock rule set: security incidents, health degradation and system
/// failures, in that matching order.
pub fn default_rules() -> Vec<CriticalEventRule> {
    vec![
        CriticalEventRule::new("security-critical", "Critical security events")
            .with_categories([EventCategory::Security])
            .with_priorities([EventPriority::Critical, EventPriority::Urgent])
            .with_escalation(Duration::from_secs(300), EscalationLevel::Level4),
        CriticalEventRule::new("health-alerts", "Health and performance alerts")
            .with_types([EventType::HealthAlert, EventType::PerformanceAlert])
            .with_escalation(Duration::from_secs(600), EscalationLevel::Level3),
        CriticalEventRule::new("system-failures", "Backup, restore and service failures")
            .with_types([
                EventType::BackupFailed,
                EventType::RestoreFailed,
                EventType::ServiceStopped,
            ])
            .with_escalation(Duration::from_secs(900), EscalationLevel::Level3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn ladder_advances_and_saturates() {
        assert_eq!(EscalationLevel::None.next(), EscalationLevel::Level1);
        assert_eq!(EscalationLevel::Level1.next(), EscalationLevel::Level2);
        assert_eq!(EscalationLevel::Level4.next(), EscalationLevel::Level4);
        assert!(EscalationLevel::Level3 > EscalationLevel::Level1);
    }

    #[test]
    fn rule_matching_is_a_conjunction_of_set_constraints() {
        let rule = CriticalEventRule::new("r", "r")
            .with_categories([EventCategory::Security])
            .with_priorities([EventPriority::Critical, EventPriority::Urgent]);

        let critical_security = Event::new(EventType::SecurityAlert, Map::new());
        assert!(rule.matches(&critical_security));

        let low_security = Event::new(EventType::SecurityAlert, Map::new())
            .with_priority(EventPriority::Normal);
        assert!(!rule.matches(&low_security));

        let health = Event::new(EventType::HealthAlert, Map::new());
        assert!(!rule.matches(&health));
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut rule = CriticalEventRule::new("r", "r");
        rule.enabled = false;
        assert!(!rule.matches(&Event::new(EventType::SecurityAlert, Map::new())));
    }

    #[test]
    fn default_rules_cover_the_critical_track() {
        let rules = default_rules();
        assert_eq!(rules.len(), 3);

        let security = Event::new(EventType::ThreatDetected, Map::new());
        assert!(rules[0].matches(&security));

        let health = Event::new(EventType::HealthAlert, Map::new());
        assert!(rules[1].matches(&health));

        let backup = Event::new(EventType::BackupFailed, Map::new());
        assert!(rules[2].matches(&backup));
        assert!(!rules[0].matches(&backup));
    }
}
