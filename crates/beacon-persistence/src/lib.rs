//! Persistence contracts for the beacon core.
//!
//! The SQL engine itself is an external collaborator; the core talks to
//! storage only through the [`Repository`] trait family. The in-memory
//! implementation backs tests and single-process deployments.

pub mod memory;
pub mod repository;
pub mod retention;

pub use memory::InMemoryRepository;
pub use repository::{
    DeliveryStore, EventQuery, EventStore, Repository, ReplayStore, SubscriptionStore,
};
pub use retention::{RetentionConfig, RetentionSweeper};
