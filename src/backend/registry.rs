//! Registry of backend records, keyed by id, in insertion order.

use crate::backend::Backend;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The process-wide set of backends.
///
/// Insertion order is preserved because round-robin style policies and
/// tie-breaking depend on it. Lookups and snapshots take a short read lock;
/// nothing here ever blocks on I/O.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    backends: HashMap<String, Arc<Backend>>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend under `id`. Replacing an existing id keeps its
    /// position in the insertion order.
    pub fn insert(&self, id: &str, backend: Arc<Backend>) {
        let mut inner = self.inner.write().unwrap();
        if inner.backends.insert(id.to_string(), backend).is_none() {
            inner.order.push(id.to_string());
        }
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.backends.remove(id).is_some() {
            inner.order.retain(|k| k != id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.inner.read().unwrap().backends.get(id).cloned()
    }

    /// All backends in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.backends.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
