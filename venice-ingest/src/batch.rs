//! Batch Processor (§4.D): groups a polled batch into mini-batches, acquires
//! per-key locks, and runs merge conflict resolution in parallel while
//! preserving input order for delegation.

use std::future::Future;

use bytes::Bytes;

use crate::config::IngestionConfig;
use crate::error::IngestResult;
use crate::interfaces::StorageEngine;
use crate::keylock::KeyLockManager;
use crate::merge::{merge, IncomingWrite, MergeConflictResult, PriorValue, PriorValueCache};
use crate::pcs::PartitionConsumptionState;
use crate::record::{Record, TopicType, ValueEnvelope};
use std::sync::Arc;

/// Whether `records` should be routed through [`BatchProcessor::process_batch`]
/// at all, or through the per-record path (§4.E) directly. Requires
/// active/active replication, post-end-of-push, and a real-time-topic
/// origin for every record in the poll (§4.D policy gate).
pub fn should_process_as_batch(
    config: &IngestionConfig,
    pcs: &PartitionConsumptionState,
    records: &[Record],
) -> bool {
    config.active_active_replication_enabled
        && pcs.end_of_push_received()
        && records
            .iter()
            .all(|r| r.topic_type == TopicType::RealTimeTopic)
}

fn data_record_key(record: &Record) -> Option<Bytes> {
    record.value.is_data_record().then(|| record.key.clone())
}

/// Groups records into mini-batches, locks keys, resolves merge conflicts in
/// parallel, and hands each `(record, precomputed_result)` pair to
/// `delegate_one` in input order before releasing the mini-batch's locks
/// (§4.D algorithm, steps 1-4).
pub struct BatchProcessor {
    key_locks: Arc<KeyLockManager>,
    storage: Arc<dyn StorageEngine>,
    cache: Arc<PriorValueCache>,
}

impl BatchProcessor {
    pub fn new(
        key_locks: Arc<KeyLockManager>,
        storage: Arc<dyn StorageEngine>,
        cache: Arc<PriorValueCache>,
    ) -> Self {
        Self {
            key_locks,
            storage,
            cache,
        }
    }

    pub async fn process_batch<F, Fut>(
        &self,
        records: Vec<Record>,
        partition: i32,
        pool_size: usize,
        mut delegate_one: F,
    ) -> IngestResult<()>
    where
        F: FnMut(Record, Option<MergeConflictResult>) -> Fut,
        Fut: Future<Output = IngestResult<()>>,
    {
        let pool_size = pool_size.max(1);
        for mini_batch in records.chunks(pool_size) {
            let keys: Vec<Bytes> = mini_batch.iter().filter_map(data_record_key).collect();
            let guard = self.key_locks.acquire_many(keys).await;

            let resolutions =
                futures::future::join_all(mini_batch.iter().map(|r| self.resolve_one(r, partition)))
                    .await;

            for (record, merge_result) in mini_batch.iter().cloned().zip(resolutions) {
                delegate_one(record, merge_result).await?;
            }

            for cold_key in self.key_locks.release(guard) {
                self.cache.evict_on_release(&cold_key);
            }
        }
        Ok(())
    }

    /// Resolves the merge conflict for one record, or returns `None` for
    /// control messages (which carry no merge result).
    async fn resolve_one(&self, record: &Record, partition: i32) -> Option<MergeConflictResult> {
        let (new_value, schema_id, incoming_rmd) = match &record.value {
            ValueEnvelope::Put {
                value,
                schema_id,
                replication_metadata_payload,
                replication_metadata_version_id,
                ..
            } => (
                Some(value.clone()),
                Some(*schema_id),
                crate::record::ReplicationMetadata {
                    payload: replication_metadata_payload.clone().unwrap_or_default(),
                    version_id: replication_metadata_version_id.unwrap_or(*schema_id),
                },
            ),
            ValueEnvelope::Delete {
                schema_id,
                replication_metadata_payload,
            } => (
                None,
                Some(*schema_id),
                crate::record::ReplicationMetadata {
                    payload: replication_metadata_payload.clone().unwrap_or_default(),
                    version_id: *schema_id,
                },
            ),
            ValueEnvelope::Update { .. } | ValueEnvelope::ControlMessage { .. } => return None,
        };

        let prior =
            crate::merge::resolve_prior_value(&self.cache, self.storage.as_ref(), partition, &record.key)
                .await;

        let incoming = IncomingWrite {
            key: record.key.clone(),
            new_value,
            new_schema_id: schema_id,
            incoming_rmd,
        };
        let result = merge(&incoming, prior.as_ref());

        match &result {
            MergeConflictResult::NewPutWithRmd {
                new_value, new_rmd, ..
            } => self.cache.put(
                record.key.clone(),
                PriorValue {
                    value: new_value.clone(),
                    rmd: new_rmd.clone(),
                },
            ),
            MergeConflictResult::TombstoneWithRmd { .. } => self.cache.invalidate(&record.key),
            MergeConflictResult::UpdateIgnored => {}
        }

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::StoreVersionState;
    use crate::pcs::Role;
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct EmptyStorage;

    #[async_trait]
    impl StorageEngine for EmptyStorage {
        async fn get(
            &self,
            _partition: i32,
            _key: &[u8],
        ) -> Result<
            Option<(Bytes, crate::record::ReplicationMetadata)>,
            crate::error::PartitionIngestionError,
        > {
            Ok(None)
        }
        async fn get_store_version_state(&self, _partition: i32) -> Option<StoreVersionState> {
            None
        }
        async fn put(
            &self,
            _partition: i32,
            _key: Bytes,
            _value: Bytes,
            _rmd: Option<crate::record::ReplicationMetadata>,
        ) -> Result<(), crate::error::PartitionIngestionError> {
            Ok(())
        }
        async fn delete(
            &self,
            _partition: i32,
            _key: Bytes,
            _rmd: Option<crate::record::ReplicationMetadata>,
        ) -> Result<(), crate::error::PartitionIngestionError> {
            Ok(())
        }
    }

    fn put_record(key: &'static [u8], version_id: i32) -> Record {
        Record {
            key: Bytes::from_static(key),
            value: ValueEnvelope::Put {
                schema_id: 1,
                value: Bytes::from_static(b"v"),
                replication_metadata_payload: Some(Bytes::new()),
                replication_metadata_version_id: Some(version_id),
            },
            offset: 0,
            timestamp_ms: 0,
            upstream_cluster_id: "dc-east".into(),
            topic_type: TopicType::RealTimeTopic,
            destination_partition: 0,
            producer_metadata: crate::record::ProducerMetadata::default(),
        }
    }

    #[test]
    fn policy_gate_requires_a_a_eop_and_real_time_origin() {
        let mut config = IngestionConfig::default();
        let pcs = PartitionConsumptionState::new("store_v1_rt", 0, Role::Leader);
        let records = vec![put_record(b"k", 1)];
        assert!(!should_process_as_batch(&config, &pcs, &records));

        config.active_active_replication_enabled = true;
        pcs.mark_end_of_push_received();
        assert!(should_process_as_batch(&config, &pcs, &records));
    }

    #[tokio::test]
    async fn delegation_happens_in_input_order_even_with_parallel_resolution() {
        let processor = BatchProcessor::new(
            Arc::new(KeyLockManager::new()),
            Arc::new(EmptyStorage),
            Arc::new(PriorValueCache::new()),
        );
        let records = vec![put_record(b"a", 1), put_record(b"b", 1), put_record(b"c", 1)];

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_for_closure = seen.clone();
        processor
            .process_batch(records, 0, 2, move |record, _result| {
                let seen = seen_for_closure.clone();
                async move {
                    seen.lock().push(record.key.clone());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ]
        );
    }
}
