//! The shared store.
//!
//! Holds the latest topology and dynamic configuration behind atomic pointer
//! swaps, plus the readiness flag the API server reports. Readers never block
//! writers: they clone an `Arc` under a short read lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use trellis_controller_core::config::DynamicConfiguration;
use trellis_controller_core::topology::Topology;

#[derive(Clone, Debug, Default)]
pub struct Store(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    config: RwLock<Arc<DynamicConfiguration>>,
    topology: RwLock<Arc<Topology>>,
    ready: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a freshly built snapshot and configuration.
    pub fn publish(&self, topology: Arc<Topology>, config: Arc<DynamicConfiguration>) {
        *self.0.topology.write() = topology;
        *self.0.config.write() = config;
    }

    pub fn config(&self) -> Arc<DynamicConfiguration> {
        self.0.config.read().clone()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.0.topology.read().clone()
    }

    /// Flipped after the first successful reconciliation; never unset.
    pub fn mark_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_atomically_swapped_snapshots() {
        let store = Store::new();
        assert!(!store.is_ready());
        assert_eq!(*store.config(), DynamicConfiguration::default());

        let mut config = DynamicConfiguration::default();
        config.http.routers.insert(
            "a-foo-80-0000000000".to_string(),
            Default::default(),
        );
        store.publish(Arc::new(Topology::default()), Arc::new(config.clone()));
        store.mark_ready();

        assert!(store.is_ready());
        assert_eq!(*store.config(), config);
    }
}
