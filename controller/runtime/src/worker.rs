//! The reconciliation worker.
//!
//! A single task drains the work queue: service keys first sync the shadow
//! service, then every key rebuilds the topology and configuration and
//! publishes them to the store. Failed keys are requeued with exponential
//! backoff up to a cap; panics are caught so one bad object cannot take the
//! controller down.

use crate::metrics::Metrics;
use crate::store::Store;
use ahash::AHashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Duration;
use trellis_controller_k8s_index::{topology, Key, SharedIndex, WorkQueue};
use trellis_controller_provider::Provider;
use trellis_controller_shadow::{ShadowServiceManager, SyncError};

const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

pub struct Worker {
    index: SharedIndex,
    shadow: ShadowServiceManager,
    provider: Provider,
    store: Store,
    queue: WorkQueue,
    acl: bool,
    metrics: Metrics,
}

impl Worker {
    pub fn new(
        index: SharedIndex,
        shadow: ShadowServiceManager,
        provider: Provider,
        store: Store,
        queue: WorkQueue,
        acl: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            index,
            shadow,
            provider,
            store,
            queue,
            acl,
            metrics,
        }
    }

    pub async fn run(self) {
        let mut retries: AHashMap<Key, u32> = AHashMap::new();
        while let Some(key) = self.queue.pop().await {
            tracing::debug!(%key, "Processing");
            match AssertUnwindSafe(self.process(&key)).catch_unwind().await {
                Ok(Ok(())) => {
                    retries.remove(&key);
                }
                Ok(Err(error)) => {
                    self.metrics.reconciliation_errors.inc();
                    let attempt = retries.entry(key.clone()).or_default();
                    *attempt += 1;
                    if *attempt > MAX_RETRIES {
                        tracing::error!(%key, %error, "Retries exhausted, dropping key");
                        self.metrics.dropped_keys.inc();
                        retries.remove(&key);
                    } else {
                        let backoff = BASE_BACKOFF * 2u32.pow(*attempt - 1);
                        tracing::warn!(%key, %error, attempt, ?backoff, "Sync failed, requeueing");
                        let queue = self.queue.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(backoff).await;
                            queue.push(key);
                        });
                    }
                }
                Err(panic) => {
                    self.metrics.worker_panics.inc();
                    let message = panic
                        .downcast_ref::<&str>()
                        .copied()
                        .map(str::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "<opaque panic payload>".to_string());
                    tracing::error!(%key, panic = %message, "Worker panicked, continuing");
                    retries.remove(&key);
                }
            }
        }
        tracing::debug!("Work queue closed, worker exiting");
    }

    async fn process(&self, key: &Key) -> Result<(), SyncError> {
        if let Key::Service(id) = key {
            self.shadow.sync_service(id).await?;
        }

        let snapshot = {
            let index = self.index.read();
            topology::build(&index, self.acl)
        };
        let config = self.provider.build_config(&snapshot);
        self.store.publish(Arc::new(snapshot), Arc::new(config));
        self.store.mark_ready();
        self.metrics.reconciliations.inc();
        Ok(())
    }
}
