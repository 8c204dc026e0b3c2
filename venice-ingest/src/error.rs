//! Error taxonomy (§7).

use std::sync::Arc;

/// A fatal, partition-scoped condition. Once set on the
/// [`crate::pcs::PartitionConsumptionState`] it is returned on the next call
/// to `write()` (§7 recovery policy: fatal errors halt the partition only).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartitionIngestionError {
    /// §7.1 — fatal DIV violation observed before `END_OF_PUSH`.
    #[error("fatal data integrity violation on {topic}-{partition} at offset {offset}: {reason}")]
    FatalDivBeforeEndOfPush {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// §7.4 — schema never became available within the configured timeout.
    #[error("schema {schema_id} not available after {waited_ms}ms on {topic}-{partition}")]
    SchemaUnavailable {
        topic: String,
        partition: i32,
        schema_id: i32,
        waited_ms: u64,
    },

    /// §7.5 — the downstream produce call failed.
    #[error("produce to {topic}-{partition} failed: {reason}")]
    ProduceFailed {
        topic: String,
        partition: i32,
        reason: String,
    },

    /// §7.6 — a view writer failed during active/active fan-out.
    #[error("view writer failed for key on {topic}-{partition}: {reason}")]
    ViewWriteFailed {
        topic: String,
        partition: i32,
        reason: String,
    },

    /// §7.7 — a record's shape was invalid for the path it arrived on (e.g.
    /// an `Update` observed on a non-leader path, or a null envelope).
    #[error("invalid record shape on {topic}-{partition} at offset {offset}: {reason}")]
    InvalidRecordShape {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// §7.10 — the leader would both consume from and produce back to the
    /// local version topic.
    #[error("local version-topic feedback loop detected on {topic}-{partition}")]
    LocalVtFeedbackLoop { topic: String, partition: i32 },
}

/// Shared-ownership handle stored on the PCS; callbacks from other threads
/// only ever read this, never mutate it directly (§5 shared resources).
pub type SharedIngestionError = Arc<PartitionIngestionError>;

/// The public result type for the pipeline's `write()` entry point (§6).
pub type IngestResult<T> = Result<T, PartitionIngestionError>;
