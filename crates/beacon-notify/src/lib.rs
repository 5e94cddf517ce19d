//! Critical-alert track: rule-matched notifications with acknowledgement
//! and deadline-based escalation.

pub mod notifier;
pub mod rules;

pub use notifier::{CriticalNotification, CriticalNotifier, NotifierConfig, NotifierStatsSnapshot};
pub use rules::{default_rules, CriticalEventRule, EscalationLevel, NotificationChannel};
