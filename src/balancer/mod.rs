//! Backend selection policies.
//!
//! Every policy implements the same small capability set over the shared
//! registry: pick the next backend, look one up by id, add, remove. A
//! backend is eligible only when it is healthy and its circuit breaker
//! admits the request.

mod least_conn;
mod random;
mod round_robin;
mod weighted;

pub use least_conn::LeastConnections;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::backend::Backend;
use crate::config::Algorithm;
use std::sync::Arc;
use thiserror::Error;

/// Errors from backend selection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// The registry is empty.
    #[error("no backends registered")]
    NoBackends,
    /// The registry is non-empty but nothing is currently selectable.
    #[error("no healthy backends available")]
    NoHealthyBackends,
    /// No backend is registered under the requested id.
    #[error("backend not found")]
    NotFound,
}

/// A selection policy over the backend registry.
///
/// `next` is safe under concurrent callers and never blocks on I/O. It
/// returns only backends that were healthy and admitted by their breaker
/// at the moment of return; the caller owes the breaker exactly one
/// recorded outcome for the returned backend.
pub trait Selector: Send + Sync {
    /// Pick the next backend under this policy.
    fn next(&self) -> Result<Arc<Backend>, SelectError>;
    /// Look up a backend by id.
    fn get(&self, id: &str) -> Result<Arc<Backend>, SelectError>;
    /// Register a backend under `id`.
    fn add(&self, id: &str, backend: Arc<Backend>);
    /// Remove the backend registered under `id`.
    fn remove(&self, id: &str);
}

/// Build a selector for the configured algorithm.
pub fn new_selector(algorithm: &Algorithm) -> Arc<dyn Selector> {
    match algorithm {
        Algorithm::RoundRobin => Arc::new(RoundRobin::new()),
        Algorithm::LeastConnections => Arc::new(LeastConnections::new()),
        Algorithm::Random => Arc::new(Random::new()),
        Algorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new()),
    }
}
