//! The closed event catalogue: event types, categories, priorities and
//! severities, plus the derived sets (critical, admin-only) and the total
//! type-to-category mapping.

use crate::errors::BeaconError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed catalogue of event types. Fixed at compile time; producers cannot
/// invent types at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Health and monitoring
    HealthUpdate,
    HealthAlert,
    ForwarderStatusChange,
    ForwarderHealthCheck,
    SystemStatus,
    SystemMetrics,
    PerformanceAlert,
    ResourceUsage,
    BindStatusUpdate,
    NetworkInterfaceMetrics,
    NetworkMetrics,
    DiskMetrics,

    // DNS management
    ZoneCreated,
    ZoneUpdated,
    ZoneDeleted,
    ZoneImported,
    ZoneExported,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    RecordBulkOperation,
    BindReload,
    BindConfigChange,
    ConfigChange,
    ConfigBackup,
    ConfigRestore,
    DnsQueryLog,
    DnsQueryBlocked,
    DnsQueryAllowed,
    DnsAnalyticsUpdate,

    // Security and RPZ
    SecurityAlert,
    SecurityThreatDetected,
    RpzUpdate,
    RpzRuleCreated,
    RpzRuleUpdated,
    RpzRuleDeleted,
    ThreatDetected,
    ThreatFeedUpdate,
    MalwareBlocked,
    PhishingBlocked,
    SuspiciousActivity,

    // Users and authentication
    UserLogin,
    UserLogout,
    UserCreated,
    UserUpdated,
    UserDeleted,
    SessionExpired,
    SessionCreated,
    AuthenticationFailed,
    PermissionDenied,

    // System lifecycle
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    RestoreStarted,
    RestoreCompleted,
    RestoreFailed,
    MaintenanceStarted,
    MaintenanceCompleted,
    ServiceStarted,
    ServiceStopped,
    ServiceRestarted,

    // Connection control
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionError,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Ping,
    Pong,
    Heartbeat,

    // Bulk operations
    BulkOperationStarted,
    BulkOperationProgress,
    BulkOperationCompleted,
    BulkOperationFailed,
    ImportStarted,
    ImportProgress,
    ImportCompleted,
    ImportFailed,
    ExportStarted,
    ExportProgress,
    ExportCompleted,
    ExportFailed,

    // Errors and diagnostics
    ErrorOccurred,
    WarningIssued,
    DebugInfo,

    // Audit
    AuditLog,

    // Custom and integration
    CustomEvent,
    WebhookTriggered,
    ApiCallMade,
    NotificationSent,
    NotificationAcknowledged,
    ReplayedEvent,
}

/// Event category, always derived from the event type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Health,
    Dns,
    Security,
    User,
    System,
    Connection,
    BulkOperation,
    Error,
    Audit,
    Custom,
}

/// Delivery urgency. `Urgent` forces immediate dispatch and bypasses
/// batching; independent of [`EventSeverity`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
    Urgent,
}

/// Criticality of the event payload itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl EventType {
    /// Every catalogue entry, in declaration order. Used for wire-string
    /// parsing and for exhaustiveness checks in tests.
    pub const ALL: [EventType; 92] = [
        EventType::HealthUpdate,
        EventType::HealthAlert,
        EventType::ForwarderStatusChange,
        EventType::ForwarderHealthCheck,
        EventType::SystemStatus,
        EventType::SystemMetrics,
        EventType::PerformanceAlert,
        EventType::ResourceUsage,
        EventType::BindStatusUpdate,
        EventType::NetworkInterfaceMetrics,
        EventType::NetworkMetrics,
        EventType::DiskMetrics,
        EventType::ZoneCreated,
        EventType::ZoneUpdated,
        EventType::ZoneDeleted,
        EventType::ZoneImported,
        EventType::ZoneExported,
        EventType::RecordCreated,
        EventType::RecordUpdated,
        EventType::RecordDeleted,
        EventType::RecordBulkOperation,
        EventType::BindReload,
        EventType::BindConfigChange,
        EventType::ConfigChange,
        EventType::ConfigBackup,
        EventType::ConfigRestore,
        EventType::DnsQueryLog,
        EventType::DnsQueryBlocked,
        EventType::DnsQueryAllowed,
        EventType::DnsAnalyticsUpdate,
        EventType::SecurityAlert,
        EventType::SecurityThreatDetected,
        EventType::RpzUpdate,
        EventType::RpzRuleCreated,
        EventType::RpzRuleUpdated,
        EventType::RpzRuleDeleted,
        EventType::ThreatDetected,
        EventType::ThreatFeedUpdate,
        EventType::MalwareBlocked,
        EventType::PhishingBlocked,
        EventType::SuspiciousActivity,
        EventType::UserLogin,
        EventType::UserLogout,
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::UserDeleted,
        EventType::SessionExpired,
        EventType::SessionCreated,
        EventType::AuthenticationFailed,
        EventType::PermissionDenied,
        EventType::BackupStarted,
        EventType::BackupCompleted,
        EventType::BackupFailed,
        EventType::RestoreStarted,
        EventType::RestoreCompleted,
        EventType::RestoreFailed,
        EventType::MaintenanceStarted,
        EventType::MaintenanceCompleted,
        EventType::ServiceStarted,
        EventType::ServiceStopped,
        EventType::ServiceRestarted,
        EventType::ConnectionEstablished,
        EventType::ConnectionClosed,
        EventType::ConnectionError,
        EventType::SubscriptionCreated,
        EventType::SubscriptionUpdated,
        EventType::SubscriptionDeleted,
        EventType::Ping,
        EventType::Pong,
        EventType::Heartbeat,
        EventType::BulkOperationStarted,
        EventType::BulkOperationProgress,
        EventType::BulkOperationCompleted,
        EventType::BulkOperationFailed,
        EventType::ImportStarted,
        EventType::ImportProgress,
        EventType::ImportCompleted,
        EventType::ImportFailed,
        EventType::ExportStarted,
        EventType::ExportProgress,
        EventType::ExportCompleted,
        EventType::ExportFailed,
        EventType::ErrorOccurred,
        EventType::WarningIssued,
        EventType::DebugInfo,
        EventType::AuditLog,
        EventType::CustomEvent,
        EventType::WebhookTriggered,
        EventType::ApiCallMade,
        EventType::NotificationSent,
        EventType::NotificationAcknowledged,
        EventType::ReplayedEvent,
    ];

    /// Wire string for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HealthUpdate => "health_update",
            EventType::HealthAlert => "health_alert",
            EventType::ForwarderStatusChange => "forwarder_status_change",
            EventType::ForwarderHealthCheck => "forwarder_health_check",
            EventType::SystemStatus => "system_status",
            EventType::SystemMetrics => "system_metrics",
            EventType::PerformanceAlert => "performance_alert",
            EventType::ResourceUsage => "resource_usage",
            EventType::BindStatusUpdate => "bind_status_update",
            EventType::NetworkInterfaceMetrics => "network_interface_metrics",
            EventType::NetworkMetrics => "network_metrics",
            EventType::DiskMetrics => "disk_metrics",
            EventType::ZoneCreated => "zone_created",
            EventType::ZoneUpdated => "zone_updated",
            EventType::ZoneDeleted => "zone_deleted",
            EventType::ZoneImported => "zone_imported",
            EventType::ZoneExported => "zone_exported",
            EventType::RecordCreated => "record_created",
            EventType::RecordUpdated => "record_updated",
            EventType::RecordDeleted => "record_deleted",
            EventType::RecordBulkOperation => "record_bulk_operation",
            EventType::BindReload => "bind_reload",
            EventType::BindConfigChange => "bind_config_change",
            EventType::ConfigChange => "config_change",
            EventType::ConfigBackup => "config_backup",
            EventType::ConfigRestore => "config_restore",
            EventType::DnsQueryLog => "dns_query_log",
            EventType::DnsQueryBlocked => "dns_query_blocked",
            EventType::DnsQueryAllowed => "dns_query_allowed",
            EventType::DnsAnalyticsUpdate => "dns_analytics_update",
            EventType::SecurityAlert => "security_alert",
            EventType::SecurityThreatDetected => "security_threat_detected",
            EventType::RpzUpdate => "rpz_update",
            EventType::RpzRuleCreated => "rpz_rule_created",
            EventType::RpzRuleUpdated => "rpz_rule_updated",
            EventType::RpzRuleDeleted => "rpz_rule_deleted",
            EventType::ThreatDetected => "threat_detected",
            EventType::ThreatFeedUpdate => "threat_feed_update",
            EventType::MalwareBlocked => "malware_blocked",
            EventType::PhishingBlocked => "phishing_blocked",
            EventType::SuspiciousActivity => "suspicious_activity",
            EventType::UserLogin => "user_login",
            EventType::UserLogout => "user_logout",
            EventType::UserCreated => "user_created",
            EventType::UserUpdated => "user_updated",
            EventType::UserDeleted => "user_deleted",
            EventType::SessionExpired => "session_expired",
            EventType::SessionCreated => "session_created",
            EventType::AuthenticationFailed => "authentication_failed",
            EventType::PermissionDenied => "permission_denied",
            EventType::BackupStarted => "backup_started",
            EventType::BackupCompleted => "backup_completed",
            EventType::BackupFailed => "backup_failed",
            EventType::RestoreStarted => "restore_started",
            EventType::RestoreCompleted => "restore_completed",
            EventType::RestoreFailed => "restore_failed",
            EventType::MaintenanceStarted => "maintenance_started",
            EventType::MaintenanceCompleted => "maintenance_completed",
            EventType::ServiceStarted => "service_started",
            EventType::ServiceStopped => "service_stopped",
            EventType::ServiceRestarted => "service_restarted",
            EventType::ConnectionEstablished => "connection_established",
            EventType::ConnectionClosed => "connection_closed",
            EventType::ConnectionError => "connection_error",
            EventType::SubscriptionCreated => "subscription_created",
            EventType::SubscriptionUpdated => "subscription_updated",
            EventType::SubscriptionDeleted => "subscription_deleted",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::Heartbeat => "heartbeat",
            EventType::BulkOperationStarted => "bulk_operation_started",
            EventType::BulkOperationProgress => "bulk_operation_progress",
            EventType::BulkOperationCompleted => "bulk_operation_completed",
            EventType::BulkOperationFailed => "bulk_operation_failed",
            EventType::ImportStarted => "import_started",
            EventType::ImportProgress => "import_progress",
            EventType::ImportCompleted => "import_completed",
            EventType::ImportFailed => "import_failed",
            EventType::ExportStarted => "export_started",
            EventType::ExportProgress => "export_progress",
            EventType::ExportCompleted => "export_completed",
            EventType::ExportFailed => "export_failed",
            EventType::ErrorOccurred => "error_occurred",
            EventType::WarningIssued => "warning_issued",
            EventType::DebugInfo => "debug_info",
            EventType::AuditLog => "audit_log",
            EventType::CustomEvent => "custom_event",
            EventType::WebhookTriggered => "webhook_triggered",
            EventType::ApiCallMade => "api_call_made",
            EventType::NotificationSent => "notification_sent",
            EventType::NotificationAcknowledged => "notification_acknowledged",
            EventType::ReplayedEvent => "replayed_event",
        }
    }

    /// Category of this event type. Total over the catalogue.
    pub fn category(&self) -> EventCategory {
        use EventType::*;
        match self {
            HealthUpdate | HealthAlert | ForwarderStatusChange | ForwarderHealthCheck
            | SystemStatus | SystemMetrics | PerformanceAlert | ResourceUsage
            | BindStatusUpdate | NetworkInterfaceMetrics | NetworkMetrics | DiskMetrics => {
                EventCategory::Health
            }
            ZoneCreated | ZoneUpdated | ZoneDeleted | ZoneImported | ZoneExported
            | RecordCreated | RecordUpdated | RecordDeleted | RecordBulkOperation | BindReload
            | BindConfigChange | ConfigChange | ConfigBackup | ConfigRestore | DnsQueryLog
            | DnsQueryBlocked | DnsQueryAllowed | DnsAnalyticsUpdate => EventCategory::Dns,
            SecurityAlert | SecurityThreatDetected | RpzUpdate | RpzRuleCreated
            | RpzRuleUpdated | RpzRuleDeleted | ThreatDetected | ThreatFeedUpdate
            | MalwareBlocked | PhishingBlocked | SuspiciousActivity => EventCategory::Security,
            UserLogin | UserLogout | UserCreated | UserUpdated | UserDeleted | SessionExpired
            | SessionCreated | AuthenticationFailed | PermissionDenied => EventCategory::User,
            BackupStarted | BackupCompleted | BackupFailed | RestoreStarted | RestoreCompleted
            | RestoreFailed | MaintenanceStarted | MaintenanceCompleted | ServiceStarted
            | ServiceStopped | ServiceRestarted => EventCategory::System,
            ConnectionEstablished | ConnectionClosed | ConnectionError | SubscriptionCreated
            | SubscriptionUpdated | SubscriptionDeleted | Ping | Pong | Heartbeat => {
                EventCategory::Connection
            }
            BulkOperationStarted | BulkOperationProgress | BulkOperationCompleted
            | BulkOperationFailed | ImportStarted | ImportProgress | ImportCompleted
            | ImportFailed | ExportStarted | ExportProgress | ExportCompleted | ExportFailed => {
                EventCategory::BulkOperation
            }
            ErrorOccurred | WarningIssued | DebugInfo => EventCategory::Error,
            AuditLog => EventCategory::Audit,
            CustomEvent | WebhookTriggered | ApiCallMade | NotificationSent
            | NotificationAcknowledged | ReplayedEvent => EventCategory::Custom,
        }
    }

    /// Critical event types bypass batching and feed the critical notifier.
    pub fn is_critical(&self) -> bool {
        use EventType::*;
        matches!(
            self,
            SecurityAlert
                | SecurityThreatDetected
                | ThreatDetected
                | MalwareBlocked
                | PhishingBlocked
                | SuspiciousActivity
                | HealthAlert
                | PerformanceAlert
                | ErrorOccurred
                | ConnectionError
                | BackupFailed
                | RestoreFailed
                | ServiceStopped
        )
    }

    /// Admin-only event types are delivered only to subscriptions owned by
    /// administrator users.
    pub fn is_admin_only(&self) -> bool {
        use EventType::*;
        matches!(
            self,
            UserCreated
                | UserUpdated
                | UserDeleted
                | SessionCreated
                | AuthenticationFailed
                | PermissionDenied
                | ServiceStarted
                | ServiceStopped
                | ServiceRestarted
                | MaintenanceStarted
                | MaintenanceCompleted
                | DebugInfo
                | AuditLog
        )
    }

    /// Default delivery priority for events of this type.
    pub fn default_priority(&self) -> EventPriority {
        if self.is_critical() {
            EventPriority::Critical
        } else {
            EventPriority::Normal
        }
    }

    /// Default payload severity for events of this type.
    pub fn default_severity(&self) -> EventSeverity {
        use EventType::*;
        match self {
            ErrorOccurred | BackupFailed | RestoreFailed => EventSeverity::Error,
            WarningIssued | PerformanceAlert => EventSeverity::Warning,
            t if t.is_critical() => EventSeverity::Critical,
            _ => EventSeverity::Info,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| BeaconError::validation(format!("unknown event type: {s}")))
    }
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Health => "health",
            EventCategory::Dns => "dns",
            EventCategory::Security => "security",
            EventCategory::User => "user",
            EventCategory::System => "system",
            EventCategory::Connection => "connection",
            EventCategory::BulkOperation => "bulk_operation",
            EventCategory::Error => "error",
            EventCategory::Audit => "audit",
            EventCategory::Custom => "custom",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
            EventPriority::Urgent => "urgent",
        }
    }

    /// Priorities that force the immediate dispatch path.
    pub fn is_immediate(&self) -> bool {
        matches!(self, EventPriority::Critical | EventPriority::Urgent)
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Debug => "debug",
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
            EventSeverity::Critical => "critical",
        }
    }
}

impl Default for EventSeverity {
    fn default() -> Self {
        EventSeverity::Info
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_round_trip() {
        for event_type in EventType::ALL {
            let parsed: EventType = event_type.as_str().parse().unwrap();
            assert_eq!(parsed, event_type);

            // serde and as_str must agree on the wire string
            let json = serde_json::to_value(event_type).unwrap();
            assert_eq!(json.as_str().unwrap(), event_type.as_str());
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!("zone_exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn category_is_total_and_stable() {
        assert_eq!(EventType::ZoneCreated.category(), EventCategory::Dns);
        assert_eq!(EventType::HealthAlert.category(), EventCategory::Health);
        assert_eq!(EventType::RpzRuleCreated.category(), EventCategory::Security);
        assert_eq!(EventType::AuditLog.category(), EventCategory::Audit);
        assert_eq!(EventType::ReplayedEvent.category(), EventCategory::Custom);

        // Every catalogue entry maps somewhere without panicking.
        for event_type in EventType::ALL {
            let _ = event_type.category();
        }
    }

    #[test]
    fn critical_and_admin_sets() {
        assert!(EventType::SecurityAlert.is_critical());
        assert!(EventType::ServiceStopped.is_critical());
        assert!(!EventType::ZoneCreated.is_critical());

        assert!(EventType::UserCreated.is_admin_only());
        assert!(EventType::AuditLog.is_admin_only());
        assert!(!EventType::HealthUpdate.is_admin_only());
    }

    #[test]
    fn priority_ordering_supports_promotion() {
        assert!(EventPriority::Urgent > EventPriority::Critical);
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
        assert!(EventPriority::Urgent.is_immediate());
        assert!(!EventPriority::High.is_immediate());
    }

    #[test]
    fn default_priority_and_severity_derivation() {
        assert_eq!(
            EventType::SecurityAlert.default_priority(),
            EventPriority::Critical
        );
        assert_eq!(
            EventType::ZoneCreated.default_priority(),
            EventPriority::Normal
        );
        assert_eq!(
            EventType::ErrorOccurred.default_severity(),
            EventSeverity::Error
        );
        assert_eq!(
            EventType::PerformanceAlert.default_severity(),
            EventSeverity::Warning
        );
        assert_eq!(
            EventType::SecurityAlert.default_severity(),
            EventSeverity::Critical
        );
        assert_eq!(EventType::ZoneCreated.default_severity(), EventSeverity::Info);
    }
}
