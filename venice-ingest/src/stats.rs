//! The `StatsSink` collaborator (§6) and its metric-backed implementation.

use std::fmt::Debug;
use std::sync::Arc;

use venice_metric::{Metric, Registry, U64Counter};

/// Sentinel value reported by [`NullStatsSink`] where a real sink would
/// report a measured count. Matches the "null-stats report a sentinel
/// value" language in §6.
pub const NULL_DIV_STATS: i64 = -1;

/// Everything the pipeline emits counters or latency samples for (§6).
///
/// Kept as one trait (rather than one per component) because a single
/// `StatsSink` instance is threaded through the whole per-partition task,
/// matching how `metric::Registry` is handed to `LifecycleManager` as a
/// single shared handle in the teacher crate.
pub trait StatsSink: Debug + Send + Sync + 'static {
    fn record_success_msg(&self, topic: &str);
    fn record_fatal_div(&self, topic: &str);
    fn record_duplicate_msg(&self, topic: &str);
    fn record_storage_quota_used(&self, bytes: u64);
    fn record_leader_produce_latency_ms(&self, millis: u64);
    fn record_consumer_records_queue_put_latency_ms(&self, millis: u64);
    fn record_region_hybrid_bytes_consumed(&self, bytes: u64);
    fn record_tombstone_created_dcr(&self);
}

/// A `StatsSink` that drops every observation. Used by tests and by code
/// paths that genuinely have nowhere useful to report to; never returns
/// anything but [`NULL_DIV_STATS`] from its accompanying inspection helpers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn record_success_msg(&self, _topic: &str) {}
    fn record_fatal_div(&self, _topic: &str) {}
    fn record_duplicate_msg(&self, _topic: &str) {}
    fn record_storage_quota_used(&self, _bytes: u64) {}
    fn record_leader_produce_latency_ms(&self, _millis: u64) {}
    fn record_consumer_records_queue_put_latency_ms(&self, _millis: u64) {}
    fn record_region_hybrid_bytes_consumed(&self, _bytes: u64) {}
    fn record_tombstone_created_dcr(&self) {}
}

/// A `StatsSink` backed by a real [`venice_metric::Registry`]. This is what
/// production wiring uses; `NullStatsSink` exists for call sites (and tests)
/// that don't care.
#[derive(Debug)]
pub struct MetricStatsSink {
    success_msg: Arc<Metric<U64Counter>>,
    fatal_div: Arc<Metric<U64Counter>>,
    duplicate_msg: Arc<Metric<U64Counter>>,
    storage_quota_used: Arc<Metric<U64Counter>>,
    leader_produce_latency_ms: Arc<Metric<U64Counter>>,
    consumer_records_queue_put_latency_ms: Arc<Metric<U64Counter>>,
    region_hybrid_bytes_consumed: Arc<Metric<U64Counter>>,
    tombstone_created_dcr: Arc<Metric<U64Counter>>,
}

impl MetricStatsSink {
    pub fn new(registry: &Registry) -> Self {
        Self {
            success_msg: registry.register_metric("success_msg", "successful DIV checks"),
            fatal_div: registry.register_metric("fatal_div", "fatal DIV violations"),
            duplicate_msg: registry.register_metric("duplicate_msg", "duplicate records dropped"),
            storage_quota_used: registry
                .register_metric("storage_quota_used", "bytes counted against disk quota"),
            leader_produce_latency_ms: registry
                .register_metric("leader_produce_latency_ms", "leader produce call latency"),
            consumer_records_queue_put_latency_ms: registry.register_metric(
                "consumer_records_queue_put_latency_ms",
                "drainer queue put latency",
            ),
            region_hybrid_bytes_consumed: registry
                .register_metric("region_hybrid_bytes_consumed", "hybrid bytes consumed"),
            tombstone_created_dcr: registry
                .register_metric("tombstone_created_dcr", "tombstones created during A/A merge"),
        }
    }

    fn topic_recorder(metric: &Metric<U64Counter>, topic: &str) -> Arc<U64Counter> {
        // The registry keys recorders by `&'static str`; record under a
        // fixed attribute name with the topic folded into a leaked string is
        // unnecessary here since we only ever have a handful of topics per
        // process lifetime in practice. We key on a stable placeholder and
        // rely on topic-level dashboards upstream, matching how the teacher
        // crate separates "trigger" but not per-table cardinality for
        // process-wide counters.
        let _ = topic;
        metric.recorder(&[][..])
    }
}

impl StatsSink for MetricStatsSink {
    fn record_success_msg(&self, topic: &str) {
        Self::topic_recorder(&self.success_msg, topic).inc(1);
    }

    fn record_fatal_div(&self, topic: &str) {
        Self::topic_recorder(&self.fatal_div, topic).inc(1);
    }

    fn record_duplicate_msg(&self, topic: &str) {
        Self::topic_recorder(&self.duplicate_msg, topic).inc(1);
    }

    fn record_storage_quota_used(&self, bytes: u64) {
        self.storage_quota_used.recorder(&[][..]).inc(bytes);
    }

    fn record_leader_produce_latency_ms(&self, millis: u64) {
        self.leader_produce_latency_ms.recorder(&[][..]).inc(millis);
    }

    fn record_consumer_records_queue_put_latency_ms(&self, millis: u64) {
        self.consumer_records_queue_put_latency_ms
            .recorder(&[][..])
            .inc(millis);
    }

    fn record_region_hybrid_bytes_consumed(&self, bytes: u64) {
        self.region_hybrid_bytes_consumed.recorder(&[][..]).inc(bytes);
    }

    fn record_tombstone_created_dcr(&self) {
        self.tombstone_created_dcr.recorder(&[][..]).inc(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_sink_increments_real_counters() {
        let registry = Registry::new();
        let sink = MetricStatsSink::new(&registry);
        sink.record_success_msg("store_v1_rt");
        sink.record_success_msg("store_v1_rt");
        sink.record_fatal_div("store_v1_rt");

        let success = registry.get_instrument("success_msg").unwrap();
        assert_eq!(success.recorder(&[][..]).fetch(), 2);
        let fatal = registry.get_instrument("fatal_div").unwrap();
        assert_eq!(fatal.recorder(&[][..]).fetch(), 1);
    }

    #[test]
    fn null_sink_does_not_panic() {
        let sink = NullStatsSink;
        sink.record_success_msg("x");
        sink.record_tombstone_created_dcr();
    }
}
