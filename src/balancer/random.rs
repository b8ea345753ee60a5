//! Uniform random selection.

use super::{SelectError, Selector};
use crate::backend::{Backend, Registry};
use rand::Rng;
use std::sync::Arc;

/// Random selector: a uniform pick over the selectable backends.
pub struct Random {
    registry: Registry,
}

impl Random {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for Random {
    fn next(&self) -> Result<Arc<Backend>, SelectError> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(SelectError::NoBackends);
        }

        let mut candidates: Vec<&Arc<Backend>> =
            snapshot.iter().filter(|b| b.is_selectable()).collect();

        let mut rng = rand::thread_rng();
        while !candidates.is_empty() {
            let idx = rng.gen_range(0..candidates.len());
            let backend = candidates.swap_remove(idx);
            if backend.breaker().allow() {
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BreakerConfig;
    use crate::retry::RetryPolicy;
    use std::collections::HashMap;

    fn backend(id: &str) -> Arc<Backend> {
        Arc::new(Backend::new(
            id,
            "http://127.0.0.1:9001".parse().unwrap(),
            1,
            BreakerConfig::default(),
            RetryPolicy::default(),
        ))
    }

    fn selector_with(ids: &[&str]) -> Random {
        let random = Random::new();
        for id in ids {
            random.add(id, backend(id));
        }
        random
    }

    #[test]
    fn test_empty_registry() {
        let random = Random::new();
        assert_eq!(random.next().unwrap_err(), SelectError::NoBackends);
    }

    #[test]
    fn test_every_backend_reachable() {
        let random = selector_with(&["a", "b", "c"]);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let picked = random.next().unwrap();
            *counts.entry(picked.id().to_string()).or_insert(0) += 1;
        }

        // A uniform pick over 3 backends leaves each well away from zero.
        for id in ["a", "b", "c"] {
            assert!(counts[id] > 50, "backend {} starved: {:?}", id, counts);
        }
    }

    #[test]
    fn test_only_selectable_candidates() {
        let random = selector_with(&["a", "b"]);
        random.get("a").unwrap().set_healthy(false);

        for _ in 0..20 {
            assert_eq!(random.next().unwrap().id(), "b");
        }
    }

    #[test]
    fn test_all_unavailable() {
        let random = selector_with(&["a", "b"]);
        random.get("a").unwrap().set_healthy(false);
        random.get("b").unwrap().set_healthy(false);

        assert_eq!(random.next().unwrap_err(), SelectError::NoHealthyBackends);
    }
}
