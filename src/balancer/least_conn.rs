//! Least-connections selection.

use super::{SelectError, Selector};
use crate::backend::{Backend, Registry};
use std::sync::Arc;

/// Least-connections selector.
///
/// Returns the selectable backend with the fewest in-flight requests,
/// breaking ties by insertion order. Stateless beyond the registry.
pub struct LeastConnections {
    registry: Registry,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for LeastConnections {
    fn next(&self) -> Result<Arc<Backend>, SelectError> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(SelectError::NoBackends);
        }

        // The minimum-inflight candidate may lose its breaker admission to a
        // concurrent caller; skip it and re-pick from the rest.
        let mut skipped: Vec<&str> = Vec::new();
        loop {
            let mut selected: Option<&Arc<Backend>> = None;
            let mut min_inflight = u32::MAX;

            for backend in &snapshot {
                if skipped.contains(&backend.id()) || !backend.is_selectable() {
                    continue;
                }
                let inflight = backend.inflight();
                if inflight < min_inflight {
                    min_inflight = inflight;
                    selected = Some(backend);
                }
            }

            match selected {
                None => return Err(SelectError::NoHealthyBackends),
                Some(backend) => {
                    if backend.breaker().allow() {
                        return Ok(Arc::clone(backend));
                    }
                    skipped.push(backend.id());
                }
            }
        }
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

    fn backend(id: &str) -> Arc<Backend> {
        Arc::new(Backend::new(
            id,
            "http://127.0.0.1:9001".parse().unwrap(),
            1,
            BreakerConfig::default(),
            RetryPolicy::default(),
        ))
    }

    fn selector_with(ids: &[&str]) -> LeastConnections {
        let lc = LeastConnections::new();
        for id in ids {
            lc.add(id, backend(id));
        }
        lc
    }

    #[test]
    fn test_empty_registry() {
        let lc = LeastConnections::new();
        assert_eq!(lc.next().unwrap_err(), SelectError::NoBackends);
    }

    #[test]
    fn test_picks_fewest_inflight() {
        let lc = selector_with(&["a", "b", "c"]);
        lc.get("a").unwrap().inc_inflight();
        lc.get("a").unwrap().inc_inflight();
        lc.get("b").unwrap().inc_inflight();

        assert_eq!(lc.next().unwrap().id(), "c");
    }

    #[test]
    fn test_tie_broken_by_insertion_order() {
        let lc = selector_with(&["b", "a", "c"]);
        // All zero in-flight; the first inserted wins.
        assert_eq!(lc.next().unwrap().id(), "b");
    }

    #[test]
    fn test_skips_unhealthy() {
        let lc = selector_with(&["a", "b"]);
        lc.get("a").unwrap().set_healthy(false);
        lc.get("b").unwrap().inc_inflight();

        // "a" has fewer connections but is out of rotation.
        assert_eq!(lc.next().unwrap().id(), "b");
    }

    #[test]
    fn test_all_unavailable() {
        let lc = selector_with(&["a"]);
        lc.get("a").unwrap().set_healthy(false);
        assert_eq!(lc.next().unwrap_err(), SelectError::NoHealthyBackends);
    }
}
