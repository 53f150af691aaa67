use std::sync::atomic::{AtomicU32, Ordering};

use tickflow_types::ids::NodeId;
use tickflow_types::log::error;

/// `ErrorManager` records and counts unit failures.
///
/// With a threshold set, `report` returns true once the engine-wide count
/// crosses it, which the executor turns into dag cancellation; hot paths
/// never unwind.
#[derive(Debug)]
pub struct ErrorManager {
    threshold: Option<u32>,
    count: AtomicU32,
}

impl ErrorManager {
    pub fn new_threshold(threshold: u32) -> Self {
        Self {
            threshold: Some(threshold),
            count: AtomicU32::new(0),
        }
    }

    pub fn new_unlimited() -> Self {
        Self {
            threshold: None,
            count: AtomicU32::new(0),
        }
    }

    /// Logs and counts one failure. Returns true when the threshold has been
    /// reached.
    pub fn report(&self, node: NodeId, what: &str) -> bool {
        error!("[{node}] {what}");
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        match self.threshold {
            Some(threshold) => count >= threshold,
            None => false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_trips() {
        let manager = ErrorManager::new_unlimited();
        let node = NodeId::from_parts(1, 1);
        for _ in 0..100 {
            assert!(!manager.report(node, "transient failure"));
        }
        assert_eq!(manager.count(), 100);
    }

    #[test]
    fn threshold_trips_once_reached() {
        let manager = ErrorManager::new_threshold(3);
        let node = NodeId::from_parts(1, 1);
        assert!(!manager.report(node, "x"));
        assert!(!manager.report(node, "x"));
        assert!(manager.report(node, "x"));
        assert!(manager.report(node, "x"));
    }
}
