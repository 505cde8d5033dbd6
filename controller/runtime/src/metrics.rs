use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub reconciliations: Counter,
    pub reconciliation_errors: Counter,
    pub dropped_keys: Counter,
    pub worker_panics: Counter,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "reconciliations",
            "Completed reconciliation passes",
            metrics.reconciliations.clone(),
        );
        registry.register(
            "reconciliation_errors",
            "Reconciliation passes that failed and were requeued",
            metrics.reconciliation_errors.clone(),
        );
        registry.register(
            "dropped_keys",
            "Keys dropped after exhausting their retries",
            metrics.dropped_keys.clone(),
        );
        registry.register(
            "worker_panics",
            "Panics caught in the reconciliation worker",
            metrics.worker_panics.clone(),
        );
        metrics
    }
}
