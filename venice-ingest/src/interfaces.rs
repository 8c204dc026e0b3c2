//! Narrow traits for the collaborators this crate consumes (§6). Each one is
//! deliberately cut down to only the operations the delegator/merge path
//! actually calls; the log consumer client, the on-disk engine, and the
//! network listener live outside this crate's scope (§1).

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::PartitionIngestionError;
use crate::record::{ReplicationMetadata, ValueEnvelope};

/// A produce destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

/// Producer metadata mode selected at the call site (§9 design note:
/// "pass-through" vs "regenerated").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMetadataMode {
    /// Reuse the upstream producer's GUID/segment/sequence for DIV
    /// continuity at followers.
    PassThrough,
    /// Stamp this leader's own producer metadata.
    Regenerated,
}

/// A record handed to [`LogProducer::send`].
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    pub destination: TopicPartition,
    pub key: Bytes,
    pub value: ValueEnvelope,
    pub headers: BTreeMap<String, Bytes>,
    pub producer_timestamp_ms: i64,
    pub metadata_mode: ProducerMetadataMode,
}

/// What a successful produce reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceAck {
    pub offset: i64,
}

pub type ProduceResult = Result<ProduceAck, PartitionIngestionError>;

/// The downstream log producer (§6). `send` is synchronous in the sense that
/// calling it is the "queued" moment the spec's `last_vt_produce_future`
/// tracks (§3); the returned boxed future resolves on acknowledgement, which
/// is the moment §4.G's callback logic runs via combinators attached by the
/// caller.
pub trait LogProducer: Debug + Send + Sync + 'static {
    /// Enqueue `record` for production. Must be callable many times
    /// concurrently; ordering across calls is the caller's responsibility
    /// (§5, `last_vt_produce_future` chain).
    fn send(&self, record: ProducedRecord) -> BoxFuture<'static, ProduceResult>;

    /// Block until all previously queued sends have been acknowledged.
    fn flush(&self) -> BoxFuture<'static, Result<(), PartitionIngestionError>>;
}

/// Materialized per-store-version state (schema/chunking flags). Lazily
/// available after `START_OF_PUSH` has primed it (§4.E).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreVersionState {
    pub chunked: bool,
    pub version: i32,
}

/// The local storage engine (§6), narrowed to what the merge path and the
/// drainer's apply loop need.
#[async_trait]
pub trait StorageEngine: Debug + Send + Sync + 'static {
    /// Fetch the current value and replication metadata for `key`, if any.
    async fn get(
        &self,
        partition: i32,
        key: &[u8],
    ) -> Result<Option<(Bytes, ReplicationMetadata)>, PartitionIngestionError>;

    /// Fetch the store-version state, if it has been primed yet.
    async fn get_store_version_state(&self, partition: i32) -> Option<StoreVersionState>;

    async fn put(
        &self,
        partition: i32,
        key: Bytes,
        value: Bytes,
        rmd: Option<ReplicationMetadata>,
    ) -> Result<(), PartitionIngestionError>;

    async fn delete(
        &self,
        partition: i32,
        key: Bytes,
        rmd: Option<ReplicationMetadata>,
    ) -> Result<(), PartitionIngestionError>;
}

/// The schema registry (§6), narrowed to the single membership check the
/// pre-flight schema wait needs.
#[async_trait]
pub trait SchemaRegistry: Debug + Send + Sync + 'static {
    async fn is_schema_known(&self, schema_id: i32) -> bool;
}

/// A side-channel writer materializing a derived projection of the store
/// (§6, §4.F).
#[async_trait]
pub trait ViewWriter: Debug + Send + Sync + 'static {
    #[allow(clippy::too_many_arguments)]
    async fn process_record(
        &self,
        new_value: Option<&Bytes>,
        old_value: Option<&Bytes>,
        key: &Bytes,
        version: i32,
        new_schema_id: Option<i32>,
        old_schema_id: Option<i32>,
        rmd: &ReplicationMetadata,
    ) -> Result<(), PartitionIngestionError>;
}

/// Quota enforcement for reads/writes on this partition (§6). Out of scope
/// per §1 beyond this narrow interface.
pub trait QuotaManager: Debug + Send + Sync + 'static {
    /// Returns `true` if the partition is within quota after accounting for
    /// `bytes_read`.
    fn enforce_partition_quota(&self, partition: i32, bytes_read: u64) -> bool;

    fn disk_quota_usage(&self) -> u64;
}
