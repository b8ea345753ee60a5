//! Asynchronous health check scheduling.
//!
//! One periodic task per registered backend. Each tick runs a single probe
//! under the configured timeout, writes the verdict to the backend's health
//! flag, and publishes a result on a bounded stream. Results for one backend
//! are published in probe-completion order because each backend has exactly
//! one loop.

use crate::backend::Backend;
use crate::health::Probe;
use crate::metrics::Metrics;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the result stream. When no consumer keeps up, the newest
/// result is dropped rather than blocking a probe loop.
const RESULT_BUFFER: usize = 100;

/// Outcome of one probe, published on the result stream.
#[derive(Debug, Clone)]
pub struct HealthResult {
    pub backend_id: String,
    pub ok: bool,
    pub error: Option<String>,
    pub timestamp: SystemTime,
    pub latency: Duration,
}

struct Entry {
    backend: Arc<Backend>,
    probe: Arc<dyn Probe>,
}

/// Schedules periodic health probes for registered backends.
pub struct HealthScheduler {
    interval: Duration,
    timeout: Duration,
    metrics: Metrics,
    entries: DashMap<String, Entry>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    results_tx: mpsc::Sender<HealthResult>,
    results_rx: Mutex<Option<mpsc::Receiver<HealthResult>>>,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl HealthScheduler {
    pub fn new(interval: Duration, timeout: Duration, metrics: Metrics) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            interval,
            timeout,
            metrics,
            entries: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a backend for probing. Returns `false` if the scheduler has
    /// already been stopped; such probes are never scheduled.
    pub fn add(&self, id: &str, backend: Arc<Backend>, probe: Arc<dyn Probe>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(backend = id, "health scheduler is stopped, probe refused");
            return false;
        }

        if self.started.load(Ordering::SeqCst) {
            self.spawn_probe(id, Arc::clone(&backend), Arc::clone(&probe));
        }
        self.entries.insert(id.to_string(), Entry { backend, probe });
        true
    }

    /// Remove a backend from monitoring, aborting its probe loop.
    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
        if let Some(task) = self.tasks.lock().unwrap().remove(id) {
            task.abort();
        }
    }

    /// Start a probe loop for every registered backend.
    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for entry in self.entries.iter() {
            self.spawn_probe(
                entry.key(),
                Arc::clone(&entry.value().backend),
                Arc::clone(&entry.value().probe),
            );
        }
        info!(backends = self.entries.len(), "health scheduler started");
    }

    /// Stop all probe loops and wait for in-flight probes to finish their
    /// deadline-bounded work. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(());
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("health scheduler stopped");
    }

    /// Take the result stream. Yields `None` after the first call.
    pub fn results(&self) -> Option<mpsc::Receiver<HealthResult>> {
        self.results_rx.lock().unwrap().take()
    }

    fn spawn_probe(&self, id: &str, backend: Arc<Backend>, probe: Arc<dyn Probe>) {
        let id = id.to_string();
        let interval = self.interval;
        let timeout = self.timeout;
        let metrics = self.metrics.clone();
        let results_tx = self.results_tx.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate tick so the first probe lands one interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let outcome = match tokio::time::timeout(timeout, probe.check()).await {
                            Ok(result) => result,
                            Err(_) => Err(format!("probe timed out after {:?}", timeout)),
                        };
                        let latency = started.elapsed();
                        let ok = outcome.is_ok();

                        backend.set_healthy(ok);
                        match &outcome {
                            Ok(()) => {
                                debug!(backend = %id, latency_ms = latency.as_millis(), "health check passed");
                            }
                            Err(reason) => {
                                warn!(backend = %id, error = %reason, "health check failed");
                                metrics.inc_health_check_failures(&id);
                            }
                        }

                        // Never block the probe loop; drop the result if the
                        // consumer lags.
                        let _ = results_tx.try_send(HealthResult {
                            backend_id: id.clone(),
                            ok,
                            error: outcome.err(),
                            timestamp: SystemTime::now(),
                            latency,
                        });
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });

        if let Some(old) = self.tasks.lock().unwrap().insert(task_id, handle) {
            old.abort();
        }
    }
}
