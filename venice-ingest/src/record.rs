//! The log envelope and its variants (§3 Data model).

use bytes::Bytes;
use std::collections::BTreeMap;

/// Reserved control-message key. A control message with this key is a
/// heartbeat rather than a segment boundary marker.
pub const HEART_BEAT_KEY: &[u8] = b"HEART_BEAT";

/// Schema id reserved for chunk manifests; requires
/// `StoreVersionState::chunked` to be set.
pub const CHUNK_SCHEMA_ID: i32 = -10;
/// Schema id reserved for chunked-value manifests; requires
/// `StoreVersionState::chunked` to be set.
pub const CHUNKED_VALUE_MANIFEST_SCHEMA_ID: i32 = -20;
/// Sentinel schema id meaning "no schema id carried on this record" (used by
/// some control messages). Never polled against the registry.
pub const NO_SCHEMA_ID: i32 = -1;

/// Which topic a record arrived from. Drives DIV tracker selection (§3) and
/// several delegator decisions (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicType {
    /// The per-store-version derived log this pipeline produces into.
    VersionTopic,
    /// The hybrid real-time topic fed by online writers.
    RealTimeTopic,
}

/// Control-message types from §3. `START_OF_SEGMENT`/`END_OF_SEGMENT` bound
/// a DIV segment; `START_OF_PUSH`/`END_OF_PUSH` bound a batch push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessageType {
    StartOfPush,
    EndOfPush,
    StartOfSegment,
    EndOfSegment,
    StartOfIncrementalPush,
    EndOfIncrementalPush,
    TopicSwitch,
    VersionSwap,
}

/// Replication Metadata Descriptor carried with active/active writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicationMetadata {
    /// Opaque version-vector-style payload; compared only by the merge
    /// policy, never interpreted here.
    pub payload: Bytes,
    /// Schema id the payload was encoded with.
    pub version_id: i32,
}

/// A control message's producer-supplied metadata (used to reconstruct
/// `LeaderMetadataWrapper`-equivalent pass-through state).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerMetadata {
    pub producer_guid: [u8; 16],
    pub segment_number: i32,
    pub sequence_number: i32,
    /// Wall-clock timestamp the upstream producer stamped on the record,
    /// milliseconds since epoch.
    pub producer_timestamp_ms: i64,
}

/// The tagged payload variant of a [`Record`] (§3).
#[derive(Debug, Clone)]
pub enum ValueEnvelope {
    Put {
        schema_id: i32,
        value: Bytes,
        replication_metadata_payload: Option<Bytes>,
        replication_metadata_version_id: Option<i32>,
    },
    Update {
        schema_id: i32,
        update_bytes: Bytes,
    },
    Delete {
        schema_id: i32,
        replication_metadata_payload: Option<Bytes>,
    },
    ControlMessage {
        message_type: ControlMessageType,
        headers: BTreeMap<String, Bytes>,
    },
}

impl ValueEnvelope {
    /// True for `Put`/`Update`/`Delete`, false for control messages.
    pub fn is_data_record(&self) -> bool {
        !matches!(self, ValueEnvelope::ControlMessage { .. })
    }

    pub fn schema_id(&self) -> Option<i32> {
        match self {
            ValueEnvelope::Put { schema_id, .. }
            | ValueEnvelope::Update { schema_id, .. }
            | ValueEnvelope::Delete { schema_id, .. } => Some(*schema_id),
            ValueEnvelope::ControlMessage { .. } => None,
        }
    }
}

/// A raw upstream offset, or the sentinel meaning "do not advance the
/// persisted offset for this record" (§4.E `TOPIC_SWITCH` handling, §9 open
/// design note). Kept as its own type instead of a bare `-1: i64` so the
/// "suppressed" fact can't be silently confused with a legal offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProduceOffset {
    Actual(i64),
    Suppressed,
}

/// One polled log record (§3).
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Bytes,
    pub value: ValueEnvelope,
    pub offset: i64,
    pub timestamp_ms: i64,
    pub upstream_cluster_id: String,
    pub topic_type: TopicType,
    /// Destination partition for control messages that must preserve it
    /// (`START_OF_INCREMENTAL_PUSH`/`END_OF_INCREMENTAL_PUSH`, §4.E).
    pub destination_partition: i32,
    /// Every record, data or control, carries producer metadata on the wire
    /// for DIV (§3 DIV tracker).
    pub producer_metadata: ProducerMetadata,
}

impl Record {
    /// Whether this record's key is the reserved heartbeat key.
    pub fn is_heartbeat_key(&self) -> bool {
        self.key.as_ref() == HEART_BEAT_KEY
    }

    pub fn control_message_type(&self) -> Option<ControlMessageType> {
        match &self.value {
            ValueEnvelope::ControlMessage { message_type, .. } => Some(*message_type),
            _ => None,
        }
    }
}
