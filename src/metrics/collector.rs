//! Load balancer metrics: atomic scalars plus per-backend tables.
//!
//! The series names and shapes are part of the external interface, so the
//! encoder writes Prometheus text format 0.0.4 verbatim, one block per
//! series, with backends sorted for stable output.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counter and gauge surface shared by the forwarder and health scheduler.
///
/// Cheap to clone; all clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_connections: Mutex<HashMap<String, u64>>,
    backend_requests: Mutex<HashMap<String, u64>>,
    backend_failures: Mutex<HashMap<String, u64>>,
    backend_latency_us: Mutex<HashMap<String, u64>>,
    health_check_failures: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_requests(&self) {
        self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self, backend: &str) {
        let mut map = self.inner.active_connections.lock().unwrap();
        *map.entry(backend.to_string()).or_insert(0) += 1;
    }

    /// Decrement the active-connection gauge; never drops below zero.
    pub fn dec_active_connections(&self, backend: &str) {
        let mut map = self.inner.active_connections.lock().unwrap();
        if let Some(count) = map.get_mut(backend) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn inc_backend_requests(&self, backend: &str) {
        let mut map = self.inner.backend_requests.lock().unwrap();
        *map.entry(backend.to_string()).or_insert(0) += 1;
    }

    pub fn inc_backend_failures(&self, backend: &str) {
        let mut map = self.inner.backend_failures.lock().unwrap();
        *map.entry(backend.to_string()).or_insert(0) += 1;
    }

    /// Record the most recent upstream latency for a backend.
    pub fn record_backend_latency(&self, backend: &str, latency: Duration) {
        let mut map = self.inner.backend_latency_us.lock().unwrap();
        map.insert(backend.to_string(), latency.as_micros() as u64);
    }

    pub fn inc_health_check_failures(&self, backend: &str) {
        let mut map = self.inner.health_check_failures.lock().unwrap();
        *map.entry(backend.to_string()).or_insert(0) += 1;
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.inner.failed_requests.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self, backend: &str) -> u64 {
        self.inner
            .active_connections
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    pub fn backend_requests(&self, backend: &str) -> u64 {
        self.inner
            .backend_requests
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    pub fn backend_failures(&self, backend: &str) -> u64 {
        self.inner
            .backend_failures
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    pub fn health_check_failures(&self, backend: &str) -> u64 {
        self.inner
            .health_check_failures
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    /// Encode all series in Prometheus text exposition format 0.0.4.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);

        writeln!(
            out,
            "# HELP load_balancer_total_requests Total number of requests processed"
        )
        .ok();
        writeln!(out, "# TYPE load_balancer_total_requests counter").ok();
        writeln!(out, "load_balancer_total_requests {}", self.total_requests()).ok();

        writeln!(
            out,
            "# HELP load_balancer_failed_requests Total number of failed requests"
        )
        .ok();
        writeln!(out, "# TYPE load_balancer_failed_requests counter").ok();
        writeln!(out, "load_balancer_failed_requests {}", self.failed_requests()).ok();

        Self::render_table(
            &mut out,
            "load_balancer_active_connections",
            "Number of active connections per backend",
            "gauge",
            &self.inner.active_connections,
        );
        Self::render_table(
            &mut out,
            "load_balancer_backend_requests",
            "Number of requests per backend",
            "counter",
            &self.inner.backend_requests,
        );
        Self::render_table(
            &mut out,
            "load_balancer_backend_failures",
            "Number of failures per backend",
            "counter",
            &self.inner.backend_failures,
        );
        Self::render_table(
            &mut out,
            "load_balancer_backend_latency_microseconds",
            "Latency per backend in microseconds",
            "gauge",
            &self.inner.backend_latency_us,
        );
        Self::render_table(
            &mut out,
            "load_balancer_health_check_failures",
            "Number of health check failures per backend",
            "counter",
            &self.inner.health_check_failures,
        );

        out
    }

    fn render_table(
        out: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        table: &Mutex<HashMap<String, u64>>,
    ) {
        writeln!(out, "# HELP {} {}", name, help).ok();
        writeln!(out, "# TYPE {} {}", name, kind).ok();

        let map = table.lock().unwrap();
        let mut backends: Vec<_> = map.keys().collect();
        backends.sort();
        for backend in backends {
            writeln!(out, "{}{{backend=\"{}\"}} {}", name, backend, map[backend]).ok();
        }
    }
}
