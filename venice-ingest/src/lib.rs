//! Per-partition leader ingestion pipeline.
//!
//! Consumes a polled batch of records for one partition, validates data
//! integrity (DIV), delegates each record to the right produce path
//! (pass-through, regenerated, or active/active merge), fans out to views,
//! and drains the result into local storage — mirroring the server-side
//! half of a Venice-style write path, narrowed to the collaborator
//! interfaces in [`interfaces`].

pub mod batch;
pub mod config;
pub mod delegator;
pub mod div;
pub mod drainer;
pub mod error;
pub mod heartbeat;
pub mod interfaces;
pub mod keylock;
pub mod merge;
pub mod pcs;
pub mod pipeline;
pub mod producer;
pub mod record;
pub mod stats;

pub use batch::BatchProcessor;
pub use config::IngestionConfig;
pub use delegator::{DelegateContext, DelegationOutcome, RecordDelegator};
pub use div::{DivOutcome, DivTracker};
pub use drainer::{BoundedDrainer, Drainer, DrainerClosed, DrainerItem};
pub use error::{IngestResult, PartitionIngestionError, SharedIngestionError};
pub use interfaces::{
    LogProducer, ProduceAck, ProducedRecord, ProducerMetadataMode, ProduceResult, QuotaManager,
    SchemaRegistry, StorageEngine, StoreVersionState, TopicPartition, ViewWriter,
};
pub use keylock::KeyLockManager;
pub use merge::{IncomingWrite, MergeConflictResult, PriorValue, PriorValueCache};
pub use pcs::{GatingFuture, PartitionConsumptionState, Role};
pub use pipeline::IngestionPipeline;
pub use record::{
    ControlMessageType, ProducerMetadata, Record, ReplicationMetadata, TopicType, ValueEnvelope,
    CHUNKED_VALUE_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID, HEART_BEAT_KEY, NO_SCHEMA_ID,
};
pub use stats::{NullStatsSink, StatsSink};
