//! Round-robin pool of equivalent endpoints

use crate::error::FetchError;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ordered list of equivalent endpoints with a current index
///
/// Rotation is circular and never removes an endpoint. The index lives on the
/// instance, so two fetchers never share rotation state by accident.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<String>,
    current: AtomicUsize,
}

impl EndpointPool {
    /// Create a pool starting at the first endpoint
    pub fn new(endpoints: Vec<String>) -> Result<Self, FetchError> {
        if endpoints.is_empty() {
            return Err(FetchError::Client("no endpoints configured".to_string()));
        }
        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
        })
    }

    /// Endpoint the next request goes to
    pub fn current(&self) -> &str {
        &self.endpoints[self.current_index()]
    }

    /// Index of the current endpoint
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire) % self.endpoints.len()
    }

    /// Advance to the next endpoint, wrapping around, and return it
    pub fn rotate(&self) -> &str {
        let len = self.endpoints.len();
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
            .unwrap_or_else(|i| i);
        let next = &self.endpoints[(previous + 1) % len];
        tracing::info!(endpoint = %next, "Rotating to next endpoint");
        next
    }

    /// All endpoints in rotation order
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Number of endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false; a pool cannot be empty
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> EndpointPool {
        EndpointPool::new((0..n).map(|i| format!("http://mirror-{i}/api")).collect()).unwrap()
    }

    #[test]
    fn rotation_is_circular() {
        let pool = pool(3);
        assert_eq!(pool.current(), "http://mirror-0/api");

        let visited: Vec<String> = (0..7).map(|_| pool.rotate().to_string()).collect();
        assert_eq!(
            visited,
            vec![
                "http://mirror-1/api",
                "http://mirror-2/api",
                "http://mirror-0/api",
                "http://mirror-1/api",
                "http://mirror-2/api",
                "http://mirror-0/api",
                "http://mirror-1/api",
            ]
        );
        assert_eq!(pool.current_index(), 1);
    }

    #[test]
    fn rotation_never_removes_endpoints() {
        let pool = pool(2);
        for _ in 0..10 {
            pool.rotate();
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.endpoints()[1], "http://mirror-1/api");
    }

    #[test]
    fn single_endpoint_rotates_onto_itself() {
        let pool = pool(1);
        assert_eq!(pool.rotate(), "http://mirror-0/api");
        assert_eq!(pool.current(), "http://mirror-0/api");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(EndpointPool::new(Vec::new()).is_err());
    }
}
