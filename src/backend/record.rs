//! Backend record: identity, upstream address, and runtime state.

use crate::backend::{BreakerConfig, CircuitBreaker};
use crate::retry::RetryPolicy;
use hyper::Uri;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One upstream HTTP server.
///
/// Created once at startup and never destroyed; identified by an opaque id
/// that stays stable for the life of the process. The health flag is owned
/// by the health scheduler, the in-flight counter by the forwarder, and the
/// circuit breaker by whichever of them records outcomes.
#[derive(Debug)]
pub struct Backend {
    id: String,
    upstream: Uri,
    weight: u32,
    healthy: AtomicBool,
    inflight: AtomicU32,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        upstream: Uri,
        weight: u32,
        breaker: BreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            upstream,
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
            inflight: AtomicU32::new(0),
            breaker: CircuitBreaker::new(breaker),
            retry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upstream(&self) -> &Uri {
        &self.upstream
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Healthy and the breaker would currently let a request through.
    /// Non-reserving; see [`CircuitBreaker::can_pass`].
    pub fn is_selectable(&self) -> bool {
        self.is_healthy() && self.breaker.can_pass()
    }

    /// Healthy and the breaker admits this request. Reserving; the caller
    /// must record an outcome on the breaker afterwards.
    pub fn admit(&self) -> bool {
        self.is_healthy() && self.breaker.allow()
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn inc_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the in-flight counter; never drops below zero.
    pub fn dec_inflight(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}
