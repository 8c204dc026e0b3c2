//! Top-level pipeline entry points exposed upward (§6): `write`,
//! `destination_identifier`, `notify_of_topic_deletion`, and
//! `received_records_count`. Wires the batch processor and record delegator
//! together behind the single `write()` call a poll loop drives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::batch::{should_process_as_batch, BatchProcessor};
use crate::config::IngestionConfig;
use crate::delegator::{DelegateContext, DelegationOutcome, RecordDelegator};
use crate::error::{IngestResult, PartitionIngestionError};
use crate::interfaces::TopicPartition;
use crate::pcs::{PartitionConsumptionState, Role};
use crate::record::Record;

/// One assigned partition's ingestion pipeline (§6). Owns the
/// [`PartitionConsumptionState`] and wires every polled batch through the
/// batch processor (when eligible) or directly through the delegator.
pub struct IngestionPipeline {
    config: Arc<IngestionConfig>,
    pcs: Arc<PartitionConsumptionState>,
    delegator: Arc<RecordDelegator>,
    batch_processor: BatchProcessor,
    destination: TopicPartition,
    received_records_count: AtomicU64,
}

impl IngestionPipeline {
    pub fn new(
        config: Arc<IngestionConfig>,
        pcs: Arc<PartitionConsumptionState>,
        delegator: Arc<RecordDelegator>,
        batch_processor: BatchProcessor,
        destination: TopicPartition,
    ) -> Self {
        Self {
            config,
            pcs,
            delegator,
            batch_processor,
            destination,
            received_records_count: AtomicU64::new(0),
        }
    }

    /// The sole entry point for a polled batch (§6). Returns the first fatal
    /// error encountered, leaving the partition's PCS marked errored so the
    /// next `write()` call surfaces it immediately without reprocessing.
    pub async fn write(&self, batch_of_records: Vec<Record>) -> IngestResult<()> {
        if let Some(err) = self.pcs.fatal_error() {
            return Err((*err).clone());
        }

        self.received_records_count
            .fetch_add(batch_of_records.len() as u64, Ordering::SeqCst);

        let partition = self.pcs.partition();
        let should_produce_downstream = matches!(self.pcs.role(), Role::Leader);

        if should_process_as_batch(&self.config, &self.pcs, &batch_of_records) {
            let destination = self.destination.clone();
            let delegator = self.delegator.clone();
            let pcs = self.pcs.clone();
            self.batch_processor
                .process_batch(
                    batch_of_records,
                    partition,
                    self.config.parallel_processing_pool_size,
                    move |record, precomputed| {
                        let delegator = delegator.clone();
                        let pcs = pcs.clone();
                        let destination = destination.clone();
                        let upstream_url = record.upstream_cluster_id.clone();
                        async move {
                            delegator
                                .delegate(
                                    DelegateContext {
                                        record,
                                        partition,
                                        upstream_url,
                                        should_produce_downstream,
                                        destination,
                                        precomputed,
                                        would_feedback_loop: false,
                                    },
                                    pcs,
                                )
                                .await
                                .map(|_| ())
                        }
                    },
                )
                .await
        } else {
            for record in batch_of_records {
                let upstream_url = record.upstream_cluster_id.clone();
                self.delegator
                    .delegate(
                        DelegateContext {
                            record,
                            partition,
                            upstream_url,
                            should_produce_downstream,
                            destination: self.destination.clone(),
                            precomputed: None,
                            would_feedback_loop: false,
                        },
                        self.pcs.clone(),
                    )
                    .await
                    .map(delegation_outcome_is_discarded)?;
            }
            Ok(())
        }
    }

    /// Target version-topic identity this partition produces into (§6).
    pub fn destination_identifier(&self) -> &TopicPartition {
        &self.destination
    }

    /// Marks the partition fatally errored because its topic was deleted out
    /// from under it (§6). The next `write()` surfaces this immediately.
    pub fn notify_of_topic_deletion(&self, topic: &str) {
        self.pcs.set_fatal_error(Arc::new(PartitionIngestionError::InvalidRecordShape {
            topic: topic.to_string(),
            partition: self.pcs.partition(),
            offset: -1,
            reason: "topic was deleted while this partition was being consumed".to_string(),
        }));
    }

    /// Total records ever passed to `write()`, for tests/observability (§6).
    pub fn received_records_count(&self) -> u64 {
        self.received_records_count.load(Ordering::SeqCst)
    }
}

fn delegation_outcome_is_discarded(_outcome: DelegationOutcome) {}
