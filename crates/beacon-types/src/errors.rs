//! Error taxonomy for the beacon core.
//!
//! Validation, NotFound, PermissionDenied and Conflict are surfaced to the
//! caller; QueueFull, TransientDelivery, Persistence and Cancelled are
//! absorbed by the core and exposed through counters.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T, E = BeaconError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum BeaconError {
    /// Malformed input at a public contract. Surfaced, never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller is neither the owner nor an admin.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Duplicate entity under a unique constraint.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Ingress queue saturated; the bus falls back to inline processing.
    #[error("ingress queue full ({pending} pending)")]
    QueueFull { pending: usize },

    /// A single delivery attempt to a session failed; retried with backoff.
    #[error("delivery failed: {message}")]
    TransientDelivery { message: String },

    /// Repository write failed; the real-time path continues.
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// Cooperative cancellation. Terminal, not an error condition.
    #[error("operation cancelled")]
    Cancelled,
}

impl BeaconError {
    pub fn validation(message: impl Into<String>) -> Self {
        BeaconError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        BeaconError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        BeaconError::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        BeaconError::Conflict {
            message: message.into(),
        }
    }

    pub fn transient_delivery(message: impl Into<String>) -> Self {
        BeaconError::TransientDelivery {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        BeaconError::Persistence {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the boundary layer.
    pub fn code(&self) -> &'static str {
        match self {
            BeaconError::Validation { .. } => "validation_error",
            BeaconError::NotFound { .. } => "not_found",
            BeaconError::PermissionDenied { .. } => "permission_denied",
            BeaconError::Conflict { .. } => "conflict",
            BeaconError::QueueFull { .. } => "queue_full",
            BeaconError::TransientDelivery { .. } => "transient_delivery_error",
            BeaconError::Persistence { .. } => "persistence_error",
            BeaconError::Cancelled => "cancelled",
        }
    }

    /// Whether this error is surfaced to the caller (as opposed to absorbed
    /// into counters by the core).
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            BeaconError::Validation { .. }
                | BeaconError::NotFound { .. }
                | BeaconError::PermissionDenied { .. }
                | BeaconError::Conflict { .. }
        )
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        BeaconError::validation(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BeaconError::validation("x").code(), "validation_error");
        assert_eq!(BeaconError::not_found("subscription", "abc").code(), "not_found");
        assert_eq!(BeaconError::QueueFull { pending: 10_000 }.code(), "queue_full");
        assert_eq!(BeaconError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn surfaced_vs_absorbed() {
        assert!(BeaconError::validation("x").is_surfaced());
        assert!(BeaconError::permission_denied("x").is_surfaced());
        assert!(!BeaconError::transient_delivery("x").is_surfaced());
        assert!(!BeaconError::persistence("x").is_surfaced());
        assert!(!BeaconError::Cancelled.is_surfaced());
    }
}
