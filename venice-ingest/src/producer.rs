//! Leader Producer & Callback (§4.G). Produce calls are wrapped so that the
//! success/failure handling — stamping the durable offset, completing the
//! persisted-to-db future, enqueuing into the drainer, or recording a fatal
//! ingestion error — runs exactly once, driven by polling the returned
//! future to completion rather than a literal callback parameter (§9
//! cyclic-collaborator-graph note: PCS is reached by `Arc`, not by a raw
//! reference threaded through a callback).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::FutureExt;
use observability_deps::tracing::warn;
use parking_lot::Mutex;

use crate::drainer::{Drainer, DrainerItem};
use crate::error::SharedIngestionError;
use crate::interfaces::ProducedRecord;
use crate::pcs::{GatingFuture, PartitionConsumptionState};
use crate::stats::StatsSink;
use venice_time::SharedTimeProvider;

/// Produces `record`, then drives the §4.G callback contract when the send
/// resolves: on success, stamps the offset onto the PCS, records produce
/// latency, and — when `drain_item` is present — enqueues it into the
/// drainer; on failure, records a fatal ingestion error on `pcs`.
/// `drain_item` is `None` for control messages that have no storage effect
/// (a heartbeat or incremental-push marker must not be applied as a
/// tombstone just because it carries no `Put` payload). Returned as a
/// [`GatingFuture`] so callers can chain it directly into
/// `pcs.last_vt_produce_future` (§4.F).
pub fn produce_and_handle(
    producer: &dyn crate::interfaces::LogProducer,
    record: ProducedRecord,
    upstream_url: String,
    drain_item: Option<DrainerItem>,
    pcs: Arc<PartitionConsumptionState>,
    drainer: Arc<dyn Drainer>,
    stats: Arc<dyn StatsSink>,
    time: SharedTimeProvider,
) -> GatingFuture {
    let started = time.now();
    let send_future = producer.send(record);

    async move {
        match send_future.await {
            Ok(ack) => {
                if let Some(elapsed) = time.now().checked_duration_since(started) {
                    stats.record_leader_produce_latency_ms(elapsed.as_millis() as u64);
                }
                pcs.update_latest_rt_offset_tried_to_produce(&upstream_url, ack.offset);
                if let Some(drain_item) = drain_item {
                    if drainer.put(drain_item).await.is_err() {
                        warn!("drainer closed while enqueuing a produced record");
                    }
                }
                Ok(())
            }
            Err(err) => {
                let shared: SharedIngestionError = Arc::new(err);
                pcs.set_fatal_error(shared.clone());
                Err(shared)
            }
        }
    }
    .boxed()
    .shared()
}

/// Restores a producer's reused input-buffer headers after a retried send.
/// Must be safe to invoke more than once (§4.G) because the underlying
/// producer may retry the same buffer and call the hook again; simply
/// re-assigning the original headers is naturally idempotent.
#[derive(Debug, Clone)]
pub struct HeaderRestoreHook {
    target: Arc<Mutex<BTreeMap<String, Bytes>>>,
    original: BTreeMap<String, Bytes>,
    invoked: Arc<AtomicBool>,
}

impl HeaderRestoreHook {
    pub fn new(
        target: Arc<Mutex<BTreeMap<String, Bytes>>>,
        original: BTreeMap<String, Bytes>,
    ) -> Self {
        Self {
            target,
            original,
            invoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: subsequent calls re-apply the same original headers.
    pub fn restore(&self) {
        *self.target.lock() = self.original.clone();
        self.invoked.store(true, Ordering::SeqCst);
    }

    pub fn has_been_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drainer::DrainerClosed;
    use crate::error::PartitionIngestionError;
    use crate::interfaces::{ProduceAck, ProduceResult, ProducerMetadataMode, TopicPartition};
    use crate::pcs::Role;
    use crate::record::ValueEnvelope;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use venice_time::{MockProvider, Time};

    #[derive(Debug)]
    struct FakeProducer {
        should_fail: bool,
    }

    impl crate::interfaces::LogProducer for FakeProducer {
        fn send(&self, _record: ProducedRecord) -> BoxFuture<'static, ProduceResult> {
            let should_fail = self.should_fail;
            async move {
                if should_fail {
                    Err(PartitionIngestionError::ProduceFailed {
                        topic: "store_v1_rt".into(),
                        partition: 0,
                        reason: "broker unavailable".into(),
                    })
                } else {
                    Ok(ProduceAck { offset: 42 })
                }
            }
            .boxed()
        }

        fn flush(&self) -> BoxFuture<'static, Result<(), PartitionIngestionError>> {
            futures::future::ready(Ok(())).boxed()
        }
    }

    #[derive(Debug, Default)]
    struct CountingDrainer {
        puts: AtomicUsize,
    }

    #[async_trait]
    impl Drainer for CountingDrainer {
        async fn put(&self, _item: DrainerItem) -> Result<(), DrainerClosed> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record() -> ProducedRecord {
        ProducedRecord {
            destination: TopicPartition {
                topic: "store_v1".into(),
                partition: 0,
            },
            key: Bytes::from_static(b"k"),
            value: ValueEnvelope::Put {
                schema_id: 1,
                value: Bytes::from_static(b"v"),
                replication_metadata_payload: None,
                replication_metadata_version_id: None,
            },
            headers: BTreeMap::new(),
            producer_timestamp_ms: 0,
            metadata_mode: ProducerMetadataMode::Regenerated,
        }
    }

    fn drain_item() -> DrainerItem {
        DrainerItem {
            partition: 0,
            upstream_url: "local".into(),
            timestamp_ms: 0,
            key: Bytes::from_static(b"k"),
            value: Some(Bytes::from_static(b"v")),
            replication_metadata: None,
        }
    }

    #[tokio::test]
    async fn successful_produce_enqueues_into_the_drainer_exactly_once() {
        let producer = FakeProducer { should_fail: false };
        let pcs = Arc::new(PartitionConsumptionState::new("store_v1_rt", 0, Role::Leader));
        let drainer = Arc::new(CountingDrainer::default());
        let stats = Arc::new(crate::stats::NullStatsSink);
        let time: SharedTimeProvider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));

        let fut = produce_and_handle(
            &producer,
            record(),
            "local".to_string(),
            Some(drain_item()),
            pcs.clone(),
            drainer.clone(),
            stats,
            time,
        );
        let result = fut.await;
        assert!(result.is_ok());
        assert_eq!(drainer.puts.load(Ordering::SeqCst), 1);
        assert_eq!(pcs.leader_offset_by_upstream("local"), Some(42));
        assert!(pcs.fatal_error().is_none());
    }

    #[tokio::test]
    async fn a_missing_drain_item_is_never_enqueued() {
        let producer = FakeProducer { should_fail: false };
        let pcs = Arc::new(PartitionConsumptionState::new("store_v1_rt", 0, Role::Leader));
        let drainer = Arc::new(CountingDrainer::default());
        let stats = Arc::new(crate::stats::NullStatsSink);
        let time: SharedTimeProvider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));

        let fut = produce_and_handle(
            &producer,
            record(),
            "local".to_string(),
            None,
            pcs.clone(),
            drainer.clone(),
            stats,
            time,
        );
        let result = fut.await;
        assert!(result.is_ok());
        assert_eq!(drainer.puts.load(Ordering::SeqCst), 0);
        assert_eq!(pcs.leader_offset_by_upstream("local"), Some(42));
    }

    #[tokio::test]
    async fn failed_produce_sets_a_fatal_error_and_never_enqueues() {
        let producer = FakeProducer { should_fail: true };
        let pcs = Arc::new(PartitionConsumptionState::new("store_v1_rt", 0, Role::Leader));
        let drainer = Arc::new(CountingDrainer::default());
        let stats = Arc::new(crate::stats::NullStatsSink);
        let time: SharedTimeProvider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));

        let fut = produce_and_handle(
            &producer,
            record(),
            "local".to_string(),
            Some(drain_item()),
            pcs.clone(),
            drainer.clone(),
            stats,
            time,
        );
        let result = fut.await;
        assert!(result.is_err());
        assert_eq!(drainer.puts.load(Ordering::SeqCst), 0);
        assert!(pcs.fatal_error().is_some());
    }

    #[test]
    fn header_restore_hook_is_idempotent() {
        let mut original_headers = BTreeMap::new();
        original_headers.insert("a".to_string(), Bytes::from_static(b"1"));
        let target = Arc::new(Mutex::new(BTreeMap::new()));
        let hook = HeaderRestoreHook::new(target.clone(), original_headers.clone());

        hook.restore();
        hook.restore();
        hook.restore();

        assert_eq!(*target.lock(), original_headers);
        assert!(hook.has_been_invoked());
    }
}
