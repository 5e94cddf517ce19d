//! Historical replay: re-emission of persisted events to their owner's
//! sessions at a configurable time scale.

pub mod engine;

pub use engine::{ReplayConfig, ReplayEngine};
