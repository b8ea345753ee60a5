//! Request identifiers for tracing a request through the pipeline logs.

use uuid::Uuid;

/// Opaque per-request identifier.
#[derive(Clone, Debug)]
pub struct RequestId(String);

impl RequestId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_request_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(RequestId::new().as_str().to_string()));
        }
    }

    #[test]
    fn test_display() {
        let id = RequestId::new();
        assert_eq!(format!("{}", id), id.as_str());
    }
}
