//! Metrics collection and Prometheus exposition.

mod collector;

pub use collector::Metrics;
