//! Backend records, the process-wide registry, and per-backend circuit breaking.

mod breaker;
mod record;
mod registry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use record::Backend;
pub use registry::Registry;
