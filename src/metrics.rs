//! Pool metrics.

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Aggregate pool metrics.
///
/// Always maintained; exported only when the caller registers them via
/// [crate::Pool::register_metrics].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Bytes currently resident in bucket free lists.
    pub pooled_bytes: Gauge,
    /// Bytes neither held by clients nor pooled.
    pub unused_capacity: Gauge,
    /// Threads currently blocked waiting for capacity.
    pub waiters: Gauge,
    /// Successful acquires.
    pub acquires: Counter,
    /// Resources created through the handler.
    pub creates: Counter,
    /// Resources returned to the pool.
    pub releases: Counter,
    /// Acquires that failed because a bounded wait elapsed.
    pub timeouts: Counter,
    /// Bytes freed by destroying pooled entries.
    pub reclaimed_bytes: Counter,
}

impl Metrics {
    pub(crate) fn register(&self, registry: &mut Registry) {
        registry.register(
            "pool_pooled_bytes",
            "Bytes currently resident in pool free lists",
            self.pooled_bytes.clone(),
        );
        registry.register(
            "pool_unused_capacity_bytes",
            "Bytes neither held by clients nor pooled",
            self.unused_capacity.clone(),
        );
        registry.register(
            "pool_waiters",
            "Threads currently blocked waiting for pool capacity",
            self.waiters.clone(),
        );
        registry.register(
            "pool_acquires",
            "Total number of successful acquires",
            self.acquires.clone(),
        );
        registry.register(
            "pool_creates",
            "Total number of resources created through the handler",
            self.creates.clone(),
        );
        registry.register(
            "pool_releases",
            "Total number of resources returned to the pool",
            self.releases.clone(),
        );
        registry.register(
            "pool_timeouts",
            "Total number of acquires that timed out waiting for capacity",
            self.timeouts.clone(),
        );
        registry.register(
            "pool_reclaimed_bytes",
            "Total bytes freed by destroying pooled entries",
            self.reclaimed_bytes.clone(),
        );
    }
}
