use metric::{Metric, Registry, U64Counter};

pub(crate) const SHORT_CIRCUITS_METRIC_NAME: &str =
    "shardkeeper_catalog_transaction_short_circuits";
const SHORT_CIRCUITS_METRIC_DESCRIPTION: &str =
    "drop transactions that found the catalog entry already deleted by an earlier attempt";

#[derive(Debug, Clone)]
pub(crate) struct TransactionMetrics {
    pub(crate) short_circuits: U64Counter,
}

impl TransactionMetrics {
    pub(crate) fn new(metric_registry: &Registry) -> Self {
        let short_circuits: Metric<U64Counter> = metric_registry.register_metric(
            SHORT_CIRCUITS_METRIC_NAME,
            SHORT_CIRCUITS_METRIC_DESCRIPTION,
        );
        Self {
            short_circuits: short_circuits.recorder([]),
        }
    }
}
