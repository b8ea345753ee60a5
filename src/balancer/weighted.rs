//! Smooth weighted round-robin selection.

use super::{SelectError, Selector};
use crate::backend::{Backend, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Smooth weighted round-robin selector.
///
/// Each backend carries a signed deficit. On every pick the deficit of each
/// selectable backend grows by its weight, the backend with the largest
/// deficit wins, and the winner's deficit drops by the sum of the weights in
/// play. This interleaves picks evenly while honouring weights: weights
/// 1, 2, 3 produce the repeating sequence C B C A B C.
pub struct WeightedRoundRobin {
    registry: Registry,
    deficits: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            deficits: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for WeightedRoundRobin {
    fn next(&self) -> Result<Arc<Backend>, SelectError> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(SelectError::NoBackends);
        }

        let mut deficits = self.deficits.lock().unwrap();

        // Credit every selectable backend, remembering the candidates in
        // insertion order alongside their updated deficits.
        let mut candidates: Vec<(usize, Arc<Backend>, i64)> = Vec::new();
        let mut total: i64 = 0;
        for (idx, backend) in snapshot.iter().enumerate() {
            if !backend.is_selectable() {
                continue;
            }
            let weight = i64::from(backend.weight());
            let deficit = deficits.entry(backend.id().to_string()).or_insert(0);
            *deficit += weight;
            total += weight;
            candidates.push((idx, Arc::clone(backend), *deficit));
        }

        if candidates.is_empty() {
            return Err(SelectError::NoHealthyBackends);
        }

        // Largest deficit first; ties prefer the later insertion index.
        candidates.sort_by(|a, b| b.2.cmp(&a.2).then(b.0.cmp(&a.0)));

        for (_, backend, _) in &candidates {
            if backend.breaker().allow() {
                if let Some(deficit) = deficits.get_mut(backend.id()) {
                    *deficit -= total;
                }
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
        self.deficits.lock().unwrap().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BreakerConfig;
    use crate::retry::RetryPolicy;

    fn backend(id: &str, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::new(
            id,
            "http://127.0.0.1:9001".parse().unwrap(),
            weight,
            BreakerConfig::default(),
            RetryPolicy::default(),
        ))
    }

    #[test]
    fn test_empty_registry() {
        let wrr = WeightedRoundRobin::new();
        assert_eq!(wrr.next().unwrap_err(), SelectError::NoBackends);
    }

    #[test]
    fn test_smooth_interleaving() {
        let wrr = WeightedRoundRobin::new();
        wrr.add("a", backend("a", 1));
        wrr.add("b", backend("b", 2));
        wrr.add("c", backend("c", 3));

        let picks: Vec<_> = (0..6).map(|_| wrr.next().unwrap().id().to_string()).collect();
        assert_eq!(picks, ["c", "b", "c", "a", "b", "c"]);

        // The pattern is cyclic.
        let picks: Vec<_> = (0..6).map(|_| wrr.next().unwrap().id().to_string()).collect();
        assert_eq!(picks, ["c", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_distribution_matches_weights() {
        let wrr = WeightedRoundRobin::new();
        wrr.add("a", backend("a", 1));
        wrr.add("b", backend("b", 2));
        wrr.add("c", backend("c", 3));

        let mut counts = std::collections::HashMap::new();
        for _ in 0..60 {
            *counts.entry(wrr.next().unwrap().id().to_string()).or_insert(0) += 1;
        }

        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 20);
        assert_eq!(counts["c"], 30);
    }

    #[test]
    fn test_unhealthy_backend_keeps_no_credit() {
        let wrr = WeightedRoundRobin::new();
        wrr.add("a", backend("a", 1));
        wrr.add("b", backend("b", 1));
        wrr.get("a").unwrap().set_healthy(false);

        for _ in 0..3 {
            assert_eq!(wrr.next().unwrap().id(), "b");
        }

        // Once healthy again, "a" rejoins the rotation without a backlog of
        // accumulated weight.
        wrr.get("a").unwrap().set_healthy(true);
        let picks: Vec<_> = (0..4).map(|_| wrr.next().unwrap().id().to_string()).collect();
        assert_eq!(picks.iter().filter(|p| *p == "a").count(), 2);
    }

    #[test]
    fn test_all_unavailable() {
        let wrr = WeightedRoundRobin::new();
        wrr.add("a", backend("a", 1));
        wrr.get("a").unwrap().set_healthy(false);
        assert_eq!(wrr.next().unwrap_err(), SelectError::NoHealthyBackends);
    }

    #[test]
    fn test_remove_clears_deficit() {
        let wrr = WeightedRoundRobin::new();
        wrr.add("a", backend("a", 5));
        wrr.add("b", backend("b", 1));
        let _ = wrr.next();
        wrr.remove("a");

        assert_eq!(wrr.next().unwrap().id(), "b");
        assert_eq!(wrr.get("a").unwrap_err(), SelectError::NotFound);
    }
}
