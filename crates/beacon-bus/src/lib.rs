//! Event bus, subscription registry and delivery tracking.
//!
//! Producers emit into a bounded ingress queue; a worker pool applies global
//! filters, persists, runs in-process processors and fans out to matching
//! subscriptions, handing frames to the batcher or the immediate session
//! path. The delivery tracker records every (event, subscription) outcome
//! and drives bounded retries.

pub mod bus;
pub mod registry;
pub mod tracker;

pub use bus::{BusConfig, BusStats, BusStatsSnapshot, EmitOptions, EventBus, EventProcessor};
pub use registry::{RegistryConfig, SubscriptionRegistry};
pub use tracker::{DeliveryTracker, TrackerConfig, TrackerStatsSnapshot};
