//! System metrics producer: samples the host via sysinfo and turns the
//! samples into events on the bus.

pub mod collector;

pub use collector::{AlertGate, MetricsCollector, MetricsConfig, ResourceAlert, SystemSample};
