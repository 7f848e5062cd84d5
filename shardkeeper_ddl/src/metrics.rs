use metric::{Metric, Registry, U64Counter};

pub(crate) const LOCK_ACQUISITIONS_METRIC_NAME: &str = "shardkeeper_ddl_lock_acquisitions";
pub(crate) const LOCK_TIMEOUTS_METRIC_NAME: &str = "shardkeeper_ddl_lock_timeouts";
pub(crate) const COORDINATORS_RECOVERED_METRIC_NAME: &str =
    "shardkeeper_ddl_coordinators_recovered";

#[derive(Debug, Clone)]
pub(crate) struct LockMetrics {
    pub(crate) acquisitions: U64Counter,
    pub(crate) timeouts: U64Counter,
}

impl LockMetrics {
    pub(crate) fn new(metric_registry: &Registry) -> Self {
        let acquisitions: Metric<U64Counter> = metric_registry.register_metric(
            LOCK_ACQUISITIONS_METRIC_NAME,
            "DDL locks granted",
        );
        let timeouts: Metric<U64Counter> = metric_registry.register_metric(
            LOCK_TIMEOUTS_METRIC_NAME,
            "DDL lock requests that timed out or were interrupted by a step down",
        );
        Self {
            acquisitions: acquisitions.recorder([]),
            timeouts: timeouts.recorder([]),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceMetrics {
    pub(crate) coordinators_recovered: U64Counter,
}

impl ServiceMetrics {
    pub(crate) fn new(metric_registry: &Registry) -> Self {
        let recovered: Metric<U64Counter> = metric_registry.register_metric(
            COORDINATORS_RECOVERED_METRIC_NAME,
            "DDL coordinators rebuilt from recovery documents after a step up",
        );
        Self {
            coordinators_recovered: recovered.recorder([]),
        }
    }
}
