//! Shared data model and cross-crate contracts for the beacon event core.
//!
//! Everything wire-visible lives here: the closed event catalogue, the event
//! and filter models, batch frames, delivery/replay/subscription records, the
//! error taxonomy, and the port traits the subsystem crates implement for one
//! another.

pub mod catalogue;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod filter;
pub mod frame;
pub mod ports;
pub mod replay;
pub mod subscription;

pub use catalogue::{EventCategory, EventPriority, EventSeverity, EventType};
pub use delivery::{DeliveryMethod, DeliveryRecord, DeliveryStatus};
pub use errors::{BeaconError, Result};
pub use event::{Event, EventMetadata};
pub use filter::{CustomFilter, EventFilter, FilterOp};
pub use frame::BatchedMessage;
pub use ports::{
    AuthProvider, AuthenticatedUser, BatchSink, DeliveryReporter, Recipient, SessionRouter,
    SubscriptionBackend, UserDirectory,
};
pub use replay::{ReplaySession, ReplayStatus};
pub use subscription::{Subscription, SubscriptionUpdate};
