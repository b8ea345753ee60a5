//! Round-robin selection.

use super::{SelectError, Selector};
use crate::backend::{Backend, Registry};
use std::sync::{Arc, Mutex};

/// Round-robin selector.
///
/// Scans forward from a cursor over the insertion-ordered registry and
/// returns the first selectable backend, advancing the cursor past it.
pub struct RoundRobin {
    registry: Registry,
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            cursor: Mutex::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RoundRobin {
    fn next(&self) -> Result<Arc<Backend>, SelectError> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(SelectError::NoBackends);
        }

        let mut cursor = self.cursor.lock().unwrap();
        let len = snapshot.len();

        for offset in 0..len {
            let idx = (*cursor + offset) % len;
            let backend = &snapshot[idx];
            if backend.is_healthy() && backend.breaker().allow() {
                *cursor = (idx + 1) % len;
                return Ok(Arc::clone(backend));
            }
        }

        Err(SelectError::NoHealthyBackends)
    }

    fn get(&self, id: &str) -> Result<Arc<Backend>, SelectError> {
        self.registry.get(id).ok_or(SelectError::NotFound)
    }

    fn add(&self, id: &str, backend: Arc<Backend>) {
        self.registry.insert(id, backend);
    }

    fn remove(&self, id: &str) {
        self.registry.remove(id);
        // The cursor indexes a snapshot, not the registry, so a stale value
        // is harmless; next() wraps it via modulo.
    }
}
