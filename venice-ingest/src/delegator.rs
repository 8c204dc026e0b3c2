//! Record Delegator (§4.E): the core per-record dispatcher. Decides, for
//! every record, whether it is produced downstream, queued straight to the
//! drainer, or skipped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use observability_deps::tracing::warn;

use crate::config::IngestionConfig;
use crate::div::{DivOutcome, DivTracker};
use crate::drainer::{Drainer, DrainerItem};
use crate::error::{IngestResult, PartitionIngestionError};
use crate::heartbeat::build_heartbeat;
use crate::interfaces::{
    LogProducer, ProducedRecord, ProducerMetadataMode, SchemaRegistry, StorageEngine,
    TopicPartition, ViewWriter,
};
use crate::keylock::KeyLockManager;
use crate::merge::{fan_out_and_produce, merge, resolve_prior_value, should_produce, IncomingWrite, MergeConflictResult, PriorValueCache};
use crate::pcs::PartitionConsumptionState;
use crate::producer::produce_and_handle;
use crate::record::{
    ControlMessageType, ProduceOffset, ProducerMetadata, Record, TopicType, ValueEnvelope,
    CHUNKED_VALUE_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID, NO_SCHEMA_ID,
};
use crate::stats::StatsSink;
use venice_time::SharedTimeProvider;

/// The three outcomes every record must yield exactly one of (§4.E, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationOutcome {
    ProducedToDownstream,
    QueuedToDrainer,
    Skipped,
}

/// Caller-supplied context the delegator doesn't own: whether this record's
/// source topic requires a downstream produce at all, and where that
/// produce (if any) should land.
pub struct DelegateContext {
    pub record: Record,
    pub partition: i32,
    pub upstream_url: String,
    pub should_produce_downstream: bool,
    pub destination: TopicPartition,
    /// A merge result computed ahead of time by the batch processor
    /// (§4.D step c); when present, the A/A path skips recomputation.
    pub precomputed: Option<MergeConflictResult>,
    /// Whether producing `record` back downstream would be a local
    /// version-topic feedback loop (§4.E safety invariant). Computed by the
    /// caller, which holds the deployment's cluster/broker identity.
    pub would_feedback_loop: bool,
}

pub struct RecordDelegator {
    config: Arc<IngestionConfig>,
    div_version_topic: DivTracker,
    div_real_time_topic: DivTracker,
    vt_producer: Arc<dyn LogProducer>,
    rt_producer: Arc<dyn LogProducer>,
    storage: Arc<dyn StorageEngine>,
    schema_registry: Arc<dyn SchemaRegistry>,
    views: Vec<Arc<dyn ViewWriter>>,
    drainer: Arc<dyn Drainer>,
    stats: Arc<dyn StatsSink>,
    time: SharedTimeProvider,
    key_locks: Arc<KeyLockManager>,
    prior_value_cache: Arc<PriorValueCache>,
    sop_primed: AtomicBool,
}

impl RecordDelegator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<IngestionConfig>,
        vt_producer: Arc<dyn LogProducer>,
        rt_producer: Arc<dyn LogProducer>,
        storage: Arc<dyn StorageEngine>,
        schema_registry: Arc<dyn SchemaRegistry>,
        views: Vec<Arc<dyn ViewWriter>>,
        drainer: Arc<dyn Drainer>,
        stats: Arc<dyn StatsSink>,
        time: SharedTimeProvider,
        key_locks: Arc<KeyLockManager>,
        prior_value_cache: Arc<PriorValueCache>,
    ) -> Self {
        Self {
            config,
            div_version_topic: DivTracker::new(),
            div_real_time_topic: DivTracker::new(),
            vt_producer,
            rt_producer,
            storage,
            schema_registry,
            views,
            drainer,
            stats,
            time,
            key_locks,
            prior_value_cache,
            sop_primed: AtomicBool::new(false),
        }
    }

    fn div_tracker_for(&self, topic_type: TopicType) -> &DivTracker {
        match topic_type {
            TopicType::VersionTopic => &self.div_version_topic,
            TopicType::RealTimeTopic => &self.div_real_time_topic,
        }
    }

    fn payload_bytes(value: &ValueEnvelope) -> &[u8] {
        match value {
            ValueEnvelope::Put { value, .. } => value.as_ref(),
            ValueEnvelope::Update { update_bytes, .. } => update_bytes.as_ref(),
            ValueEnvelope::Delete { .. } | ValueEnvelope::ControlMessage { .. } => &[],
        }
    }

    /// Runs DIV (§4.A) and applies the pre/post-EOP fatal policy (§7.1,
    /// §7.2). Returns `Some(outcome)` when the record's fate is already
    /// decided (duplicate or swallowed post-EOP fatal); `None` means
    /// dispatch should continue.
    fn apply_div(
        &self,
        record: &Record,
        partition: i32,
        pcs: &PartitionConsumptionState,
        topic: &str,
    ) -> IngestResult<Option<DelegationOutcome>> {
        let tracker = self.div_tracker_for(record.topic_type);
        let outcome = match &record.value {
            ValueEnvelope::ControlMessage { message_type, headers } => {
                tracker.validate_control_message(&record.producer_metadata, *message_type, headers)
            }
            other => tracker.validate_data_record(&record.producer_metadata, Self::payload_bytes(other)),
        };

        match outcome {
            DivOutcome::Ok => {
                self.stats.record_success_msg(topic);
                Ok(None)
            }
            DivOutcome::Duplicate => {
                self.stats.record_duplicate_msg(topic);
                Ok(Some(DelegationOutcome::Skipped))
            }
            DivOutcome::Fatal(reason) => {
                self.stats.record_fatal_div(topic);
                if pcs.end_of_push_received() {
                    warn!(topic, partition, reason, "swallowing fatal DIV violation observed after end-of-push");
                    Ok(Some(DelegationOutcome::Skipped))
                } else {
                    let err = PartitionIngestionError::FatalDivBeforeEndOfPush {
                        topic: topic.to_string(),
                        partition,
                        offset: record.offset,
                        reason,
                    };
                    pcs.set_fatal_error(Arc::new(err.clone()));
                    Err(err)
                }
            }
        }
    }

    /// Resolves schema availability for a data record (§4.E pre-flight).
    async fn schema_preflight(
        &self,
        schema_id: i32,
        partition: i32,
        topic: &str,
    ) -> IngestResult<()> {
        if schema_id == NO_SCHEMA_ID {
            return Ok(());
        }
        if schema_id == CHUNK_SCHEMA_ID || schema_id == CHUNKED_VALUE_MANIFEST_SCHEMA_ID {
            let chunked = self
                .storage
                .get_store_version_state(partition)
                .await
                .map(|state| state.chunked)
                .unwrap_or(false);
            return if chunked {
                Ok(())
            } else {
                Err(PartitionIngestionError::InvalidRecordShape {
                    topic: topic.to_string(),
                    partition,
                    offset: -1,
                    reason: "chunking schema id observed but store version state is not chunked"
                        .to_string(),
                })
            };
        }

        let registry = self.schema_registry.clone();
        let poll_config = venice_backoff::PollConfig {
            delay: self.config.schema_polling_delay,
            timeout: self.config.schema_polling_timeout,
        };
        venice_backoff::poll_until_ready("schema_availability", poll_config, || {
            let registry = registry.clone();
            async move { registry.is_schema_known(schema_id).await }
        })
        .await
        .map_err(|timed_out| PartitionIngestionError::SchemaUnavailable {
            topic: topic.to_string(),
            partition,
            schema_id,
            waited_ms: timed_out.waited.as_millis() as u64,
        })
    }

    /// The sole entry point: dispatches one record (§4.E).
    pub async fn delegate(
        &self,
        ctx: DelegateContext,
        pcs: Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        if let Some(err) = pcs.fatal_error() {
            return Err((*err).clone());
        }

        if ctx.should_produce_downstream && ctx.would_feedback_loop {
            let err = PartitionIngestionError::LocalVtFeedbackLoop {
                topic: ctx.destination.topic.clone(),
                partition: ctx.partition,
            };
            pcs.set_fatal_error(Arc::new(err.clone()));
            return Err(err);
        }

        if let Some(outcome) =
            self.apply_div(&ctx.record, ctx.partition, &pcs, &ctx.destination.topic)?
        {
            return Ok(outcome);
        }

        if ctx.should_produce_downstream {
            self.delegate_leader_path(ctx, pcs).await
        } else {
            self.delegate_non_leader_path(ctx, pcs).await
        }
    }

    async fn delegate_non_leader_path(
        &self,
        ctx: DelegateContext,
        pcs: Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        if let Some(ControlMessageType::EndOfPush) = ctx.record.control_message_type() {
            let _ = self.rt_producer.flush().await;
            pcs.mark_end_of_push_received();
            pcs.set_producer_handle(self.rt_producer.clone());
        }
        Ok(DelegationOutcome::QueuedToDrainer)
    }

    async fn delegate_leader_path(
        &self,
        ctx: DelegateContext,
        pcs: Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        let DelegateContext {
            record,
            partition,
            upstream_url,
            destination,
            precomputed,
            ..
        } = ctx;

        match &record.value {
            ValueEnvelope::ControlMessage { message_type, headers } => {
                self.delegate_control_message(
                    *message_type,
                    headers.clone(),
                    &record,
                    partition,
                    &upstream_url,
                    destination,
                    &pcs,
                )
                .await
            }
            ValueEnvelope::Put { .. } | ValueEnvelope::Update { .. } | ValueEnvelope::Delete { .. } => {
                self.delegate_data_record(record, partition, upstream_url, destination, precomputed, pcs)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn delegate_control_message(
        &self,
        message_type: ControlMessageType,
        headers: BTreeMap<String, Bytes>,
        record: &Record,
        partition: i32,
        upstream_url: &str,
        destination: TopicPartition,
        pcs: &Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        match message_type {
            ControlMessageType::StartOfPush => {
                if !self.sop_primed.swap(true, Ordering::SeqCst) {
                    pcs.set_is_batch_only(!pcs.is_hybrid());
                }
                self.produce_pass_through(record, destination, partition).await?;
                Ok(DelegationOutcome::ProducedToDownstream)
            }
            ControlMessageType::EndOfPush => {
                self.produce_pass_through(record, destination, partition).await?;
                let _ = self.vt_producer.flush().await;
                pcs.mark_end_of_push_received();
                pcs.set_producer_handle(self.rt_producer.clone());
                Ok(DelegationOutcome::ProducedToDownstream)
            }
            ControlMessageType::StartOfSegment | ControlMessageType::EndOfSegment => {
                if record.topic_type != TopicType::RealTimeTopic {
                    self.produce_pass_through(record, destination, partition).await?;
                    return Ok(DelegationOutcome::ProducedToDownstream);
                }
                if record.is_heartbeat_key() && message_type == ControlMessageType::StartOfSegment
                {
                    let upstream_producer_ts_ms = record.producer_metadata.producer_timestamp_ms;
                    let heartbeat = build_heartbeat(
                        pcs,
                        destination,
                        upstream_producer_ts_ms,
                        record.timestamp_ms,
                    );
                    self.produce(heartbeat, pcs, upstream_url, partition, false)
                        .await?;
                    return Ok(DelegationOutcome::ProducedToDownstream);
                }
                Ok(DelegationOutcome::Skipped)
            }
            ControlMessageType::StartOfIncrementalPush | ControlMessageType::EndOfIncrementalPush => {
                let produced = ProducedRecord {
                    destination: TopicPartition {
                        topic: destination.topic.clone(),
                        partition: record.destination_partition,
                    },
                    key: record.key.clone(),
                    value: ValueEnvelope::ControlMessage { message_type, headers },
                    headers: BTreeMap::new(),
                    producer_timestamp_ms: record.timestamp_ms,
                    metadata_mode: ProducerMetadataMode::PassThrough,
                };
                self.produce(produced, pcs, upstream_url, partition, false)
                    .await?;
                Ok(DelegationOutcome::ProducedToDownstream)
            }
            ControlMessageType::TopicSwitch => {
                if pcs.is_data_recovery() && !pcs.is_batch_only() {
                    return Ok(DelegationOutcome::Skipped);
                }
                self.produce_pass_through_suppressed(record, destination, partition)
                    .await?;
                Ok(DelegationOutcome::ProducedToDownstream)
            }
            ControlMessageType::VersionSwap => Ok(DelegationOutcome::QueuedToDrainer),
        }
    }

    async fn produce_pass_through(
        &self,
        record: &Record,
        destination: TopicPartition,
        partition: i32,
    ) -> IngestResult<()> {
        let produced = ProducedRecord {
            destination,
            key: record.key.clone(),
            value: record.value.clone(),
            headers: BTreeMap::new(),
            producer_timestamp_ms: record.timestamp_ms,
            metadata_mode: ProducerMetadataMode::PassThrough,
        };
        self.produce_raw(produced, partition).await
    }

    async fn produce_pass_through_suppressed(
        &self,
        record: &Record,
        destination: TopicPartition,
        partition: i32,
    ) -> IngestResult<()> {
        // §9: a TOPIC_SWITCH uses `ProduceOffset::Suppressed` so the
        // produce-ack callback must not advance the persisted offset.
        let _sentinel = ProduceOffset::Suppressed;
        self.produce_pass_through(record, destination, partition).await
    }

    /// Fire-and-forget produce used for control messages that have no key
    /// or value to apply through the drainer; still drives the send to
    /// completion so a failure surfaces.
    async fn produce_raw(&self, record: ProducedRecord, _partition: i32) -> IngestResult<()> {
        self.vt_producer.send(record).await.map(|_| ())
    }

    /// Produces a record through the full §4.G callback path (offset
    /// stamping, and — for an actual data mutation — drainer enqueue).
    /// `is_tombstone` is needed because a tombstone carries no `Put` payload
    /// to read the drainer value from. A control message never has a
    /// drainer effect: it carries no key-level storage mutation, so
    /// producing one (a heartbeat, an incremental-push marker) must not be
    /// enqueued as a tombstone just because it has no `Put` value either.
    async fn produce(
        &self,
        record: ProducedRecord,
        pcs: &Arc<PartitionConsumptionState>,
        upstream_url: &str,
        partition: i32,
        is_tombstone: bool,
    ) -> IngestResult<()> {
        let drain_item = match &record.value {
            ValueEnvelope::ControlMessage { .. } => None,
            _ => Some(DrainerItem {
                partition,
                upstream_url: upstream_url.to_string(),
                timestamp_ms: record.producer_timestamp_ms,
                key: record.key.clone(),
                value: if is_tombstone {
                    None
                } else {
                    match &record.value {
                        ValueEnvelope::Put { value, .. } => Some(value.clone()),
                        _ => None,
                    }
                },
                replication_metadata: None,
            }),
        };
        let future = produce_and_handle(
            self.vt_producer.as_ref(),
            record,
            upstream_url.to_string(),
            drain_item,
            pcs.clone(),
            self.drainer.clone(),
            self.stats.clone(),
            self.time.clone(),
        );
        future.await.map_err(|err| (*err).clone())
    }

    async fn delegate_data_record(
        &self,
        record: Record,
        partition: i32,
        upstream_url: String,
        destination: TopicPartition,
        precomputed: Option<MergeConflictResult>,
        pcs: Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        if let Some(schema_id) = record.value.schema_id() {
            self.schema_preflight(schema_id, partition, &destination.topic)
                .await?;
        }

        if !pcs.end_of_push_received() {
            let produced = ProducedRecord {
                destination,
                key: record.key.clone(),
                value: record.value.clone(),
                headers: BTreeMap::new(),
                producer_timestamp_ms: record.timestamp_ms,
                metadata_mode: ProducerMetadataMode::PassThrough,
            };
            self.produce(produced, &pcs, &upstream_url, partition, false)
                .await?;
            return Ok(DelegationOutcome::ProducedToDownstream);
        }

        if !self.config.active_active_replication_enabled {
            let produced = ProducedRecord {
                destination,
                key: record.key.clone(),
                value: record.value.clone(),
                headers: BTreeMap::new(),
                producer_timestamp_ms: record.timestamp_ms,
                metadata_mode: ProducerMetadataMode::Regenerated,
            };
            self.produce(produced, &pcs, &upstream_url, partition, false)
                .await?;
            return Ok(DelegationOutcome::ProducedToDownstream);
        }

        self.delegate_active_active(record, partition, upstream_url, destination, precomputed, pcs)
            .await
    }

    async fn delegate_active_active(
        &self,
        record: Record,
        partition: i32,
        upstream_url: String,
        destination: TopicPartition,
        precomputed: Option<MergeConflictResult>,
        pcs: Arc<PartitionConsumptionState>,
    ) -> IngestResult<DelegationOutcome> {
        let result = match precomputed {
            Some(result) => result,
            None => {
                let (new_value, incoming_rmd) = match &record.value {
                    ValueEnvelope::Put {
                        value,
                        schema_id,
                        replication_metadata_payload,
                        replication_metadata_version_id,
                    } => (
                        Some(value.clone()),
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
                        crate::record::ReplicationMetadata {
                            payload: replication_metadata_payload.clone().unwrap_or_default(),
                            version_id: *schema_id,
                        },
                    ),
                    ValueEnvelope::Update { .. } => {
                        return Err(PartitionIngestionError::InvalidRecordShape {
                            topic: destination.topic.clone(),
                            partition,
                            offset: record.offset,
                            reason: "UPDATE records require per-key conflict resolution, not the A/A merge path".into(),
                        })
                    }
                    ValueEnvelope::ControlMessage { .. } => unreachable!("handled earlier"),
                };

                let guard = self.key_locks.acquire_one(record.key.clone()).await;
                let prior = resolve_prior_value(
                    &self.prior_value_cache,
                    self.storage.as_ref(),
                    partition,
                    &record.key,
                )
                .await;
                let incoming = IncomingWrite {
                    key: record.key.clone(),
                    new_value,
                    new_schema_id: record.value.schema_id(),
                    incoming_rmd,
                };
                let result = merge(&incoming, prior.as_ref());
                match &result {
                    MergeConflictResult::NewPutWithRmd { new_value, new_rmd, .. } => {
                        self.prior_value_cache.put(
                            record.key.clone(),
                            crate::merge::PriorValue {
                                value: new_value.clone(),
                                rmd: new_rmd.clone(),
                            },
                        )
                    }
                    MergeConflictResult::TombstoneWithRmd { .. } => {
                        self.prior_value_cache.invalidate(&record.key)
                    }
                    MergeConflictResult::UpdateIgnored => {}
                }
                if self.key_locks.release_one(guard) {
                    self.prior_value_cache.evict_on_release(&record.key);
                }
                result
            }
        };

        if !should_produce(&result, self.stats.as_ref()) {
            return Ok(DelegationOutcome::Skipped);
        }

        let (new_value, new_rmd, old_value, _old_rmd) = match result {
            MergeConflictResult::NewPutWithRmd {
                new_value,
                new_rmd,
                old_value,
                old_rmd,
            } => (Some(new_value), new_rmd, old_value, old_rmd),
            MergeConflictResult::TombstoneWithRmd {
                new_rmd,
                old_value,
                old_rmd,
            } => (None, new_rmd, old_value, old_rmd),
            MergeConflictResult::UpdateIgnored => unreachable!("filtered out above"),
        };

        let key = record.key.clone();
        let schema_id = record.value.schema_id();
        let vt_producer = self.vt_producer.clone();
        let drainer = self.drainer.clone();
        let stats = self.stats.clone();
        let time = self.time.clone();
        let pcs_for_produce = pcs.clone();
        let timestamp_ms = record.timestamp_ms;

        let produce_value = new_value.clone();
        let produce_rmd = new_rmd.clone();
        let produce_destination = destination.clone();
        let produce_key = key.clone();
        let produce_upstream = upstream_url.clone();

        let composite = fan_out_and_produce(
            &pcs,
            &self.views,
            key,
            new_value,
            old_value,
            destination.partition,
            schema_id,
            schema_id,
            new_rmd,
            move || {
                let produced = ProducedRecord {
                    destination: produce_destination,
                    key: produce_key.clone(),
                    value: match &produce_value {
                        Some(value) => ValueEnvelope::Put {
                            schema_id: schema_id.unwrap_or(NO_SCHEMA_ID),
                            value: value.clone(),
                            replication_metadata_payload: Some(produce_rmd.payload.clone()),
                            replication_metadata_version_id: Some(produce_rmd.version_id),
                        },
                        None => ValueEnvelope::Delete {
                            schema_id: schema_id.unwrap_or(NO_SCHEMA_ID),
                            replication_metadata_payload: Some(produce_rmd.payload.clone()),
                        },
                    },
                    headers: BTreeMap::new(),
                    producer_timestamp_ms: timestamp_ms,
                    metadata_mode: ProducerMetadataMode::Regenerated,
                };
                let drain_item = DrainerItem {
                    partition,
                    upstream_url: produce_upstream.clone(),
                    timestamp_ms,
                    key: produce_key.clone(),
                    value: produce_value.clone(),
                    replication_metadata: Some(produce_rmd.clone()),
                };
                produce_and_handle(
                    vt_producer.as_ref(),
                    produced,
                    drain_item,
                    pcs_for_produce.clone(),
                    drainer.clone(),
                    stats.clone(),
                    time.clone(),
                )
            },
        );

        tokio::spawn(async move {
            let _ = composite.await;
        });

        Ok(DelegationOutcome::ProducedToDownstream)
    }
}
