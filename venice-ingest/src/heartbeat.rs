//! Heartbeat / Leader-Completion propagation (§4.I). When a leader observes
//! a heartbeat `START_OF_SEGMENT` on the real-time topic, it emits a
//! heartbeat to the version topic carrying a `LeaderCompleteState` header.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::interfaces::{ProducedRecord, ProducerMetadataMode, TopicPartition};
use crate::pcs::PartitionConsumptionState;
use crate::record::{ControlMessageType, ValueEnvelope, HEART_BEAT_KEY};

pub const LEADER_COMPLETE_STATE_HEADER: &str = "LeaderCompleteState";

fn leader_complete_state_value(completion_reported: bool) -> &'static str {
    if completion_reported {
        "LEADER_COMPLETED"
    } else {
        "LEADER_NOT_COMPLETED"
    }
}

/// Builds the downstream heartbeat record for `destination`. Origin
/// timestamp is `max(upstream_producer_ts_ms, record_ingress_ts_ms)` to
/// tolerate producer clock drift (§4.I).
pub fn build_heartbeat(
    pcs: &PartitionConsumptionState,
    destination: TopicPartition,
    upstream_producer_ts_ms: i64,
    record_ingress_ts_ms: i64,
) -> ProducedRecord {
    let origin_ts_ms = upstream_producer_ts_ms.max(record_ingress_ts_ms);

    let mut headers = BTreeMap::new();
    headers.insert(
        LEADER_COMPLETE_STATE_HEADER.to_string(),
        Bytes::from_static(leader_complete_state_value(pcs.completion_reported()).as_bytes()),
    );

    ProducedRecord {
        destination,
        key: Bytes::from_static(HEART_BEAT_KEY),
        value: ValueEnvelope::ControlMessage {
            message_type: ControlMessageType::StartOfSegment,
            headers: BTreeMap::new(),
        },
        headers,
        producer_timestamp_ms: origin_ts_ms,
        metadata_mode: ProducerMetadataMode::Regenerated,
    }
}
