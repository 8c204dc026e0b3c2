//! Data Integrity Validation (§3, §4.B). One [`DivTracker`] is scoped to a
//! single `(topic, partition)` pair, mirroring how the real-time and
//! version-topic DIV states are kept separate per §3's note that a leader
//! holds one tracker per source topic type.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::record::{ControlMessageType, ProducerMetadata};

/// Header key an `END_OF_SEGMENT` control message carries its expected
/// rolling checksum on, big-endian `u64` (§4.A invariant ii). Absent on a
/// segment close that doesn't assert a checksum (e.g. a heartbeat's
/// `START_OF_SEGMENT`/`END_OF_SEGMENT` pair never carries one).
pub const CHECKSUM_HEADER: &str = "div.checksum";

/// Encodes `checksum` for [`CHECKSUM_HEADER`].
pub fn encode_checksum(checksum: u64) -> Bytes {
    Bytes::copy_from_slice(&checksum.to_be_bytes())
}

fn decode_checksum(headers: &BTreeMap<String, Bytes>) -> Option<u64> {
    let bytes = headers.get(CHECKSUM_HEADER)?;
    let array: [u8; 8] = bytes.as_ref().try_into().ok()?;
    Some(u64::from_be_bytes(array))
}

/// Outcome of validating one record against its producer segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivOutcome {
    /// Sequence number is exactly the next expected one; state advanced.
    Ok,
    /// Sequence number has already been seen; the record must be skipped,
    /// not reapplied.
    Duplicate,
    /// The segment's invariants were violated. Whether this halts the
    /// partition depends on whether `END_OF_PUSH` has been observed yet
    /// (§7.1); `DivTracker` itself is agnostic to that policy.
    Fatal(String),
}

#[derive(Debug, Clone)]
struct SegmentState {
    segment_number: i32,
    expected_sequence_number: i32,
    checksum: u64,
    closed: bool,
}

/// Per-producer-GUID segment tracking for one `(topic, partition)`.
#[derive(Debug, Default)]
pub struct DivTracker {
    segments: Mutex<HashMap<[u8; 16], SegmentState>>,
}

impl DivTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `START_OF_SEGMENT`/`END_OF_SEGMENT` bookkeeping. Any other control
    /// message type is a no-op here; it carries no DIV sequencing of its
    /// own (§3).
    pub fn validate_control_message(
        &self,
        producer_metadata: &ProducerMetadata,
        message_type: ControlMessageType,
        headers: &BTreeMap<String, Bytes>,
    ) -> DivOutcome {
        let mut segments = self.segments.lock();
        match message_type {
            ControlMessageType::StartOfSegment => {
                segments.insert(
                    producer_metadata.producer_guid,
                    SegmentState {
                        segment_number: producer_metadata.segment_number,
                        // The segment's own starting sequence number, not a
                        // hardcoded 0 — a segment may legally start mid-range
                        // (§8 scenario 3: `[SOS, Put seq=1, Put seq=3]` must
                        // flag the *second* Put, so the first Put's seq=1 has
                        // to be the accepted baseline, not a gap).
                        expected_sequence_number: producer_metadata.sequence_number,
                        checksum: 0,
                        closed: false,
                    },
                );
                DivOutcome::Ok
            }
            ControlMessageType::EndOfSegment => {
                match segments.get_mut(&producer_metadata.producer_guid) {
                    Some(state) if state.segment_number == producer_metadata.segment_number => {
                        if let Some(expected) = decode_checksum(headers) {
                            if expected != state.checksum {
                                return DivOutcome::Fatal(format!(
                                    "checksum mismatch on segment {}: expected {}, computed {}",
                                    state.segment_number, expected, state.checksum
                                ));
                            }
                        }
                        state.closed = true;
                        DivOutcome::Ok
                    }
                    Some(_) => DivOutcome::Fatal(
                        "END_OF_SEGMENT segment number does not match the open segment".into(),
                    ),
                    None => {
                        DivOutcome::Fatal("END_OF_SEGMENT with no open segment".into())
                    }
                }
            }
            _ => DivOutcome::Ok,
        }
    }

    /// Validates a data record's `(segment_number, sequence_number)` against
    /// the open segment for its producer, folding `payload` into the running
    /// segment checksum on success (§3).
    pub fn validate_data_record(
        &self,
        producer_metadata: &ProducerMetadata,
        payload: &[u8],
    ) -> DivOutcome {
        let mut segments = self.segments.lock();
        let state = match segments.get_mut(&producer_metadata.producer_guid) {
            Some(state) => state,
            None => {
                return DivOutcome::Fatal(
                    "data record observed before any START_OF_SEGMENT".into(),
                )
            }
        };
        if state.closed {
            return DivOutcome::Fatal("data record observed after END_OF_SEGMENT".into());
        }
        if state.segment_number != producer_metadata.segment_number {
            return DivOutcome::Fatal(format!(
                "segment number mismatch: tracker has {}, record carries {}",
                state.segment_number, producer_metadata.segment_number
            ));
        }

        let seq = producer_metadata.sequence_number;
        if seq < state.expected_sequence_number {
            return DivOutcome::Duplicate;
        }
        if seq > state.expected_sequence_number {
            return DivOutcome::Fatal(format!(
                "sequence gap on segment {}: expected {}, observed {}",
                state.segment_number, state.expected_sequence_number, seq
            ));
        }

        state.checksum = fold_checksum(state.checksum, payload);
        state.expected_sequence_number += 1;
        DivOutcome::Ok
    }
}

fn fold_checksum(running: u64, payload: &[u8]) -> u64 {
    payload
        .iter()
        .fold(running, |acc, byte| acc.rotate_left(5) ^ (*byte as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(segment: i32, sequence: i32) -> ProducerMetadata {
        ProducerMetadata {
            producer_guid: [7; 16],
            segment_number: segment,
            sequence_number: sequence,
            producer_timestamp_ms: 0,
        }
    }

    #[test]
    fn sequential_records_are_ok() {
        let tracker = DivTracker::new();
        assert_eq!(
            tracker.validate_control_message(
                &producer(0, 0),
                ControlMessageType::StartOfSegment,
                &BTreeMap::new()
            ),
            DivOutcome::Ok
        );
        assert_eq!(
            tracker.validate_data_record(&producer(0, 0), b"a"),
            DivOutcome::Ok
        );
        assert_eq!(
            tracker.validate_data_record(&producer(0, 1), b"b"),
            DivOutcome::Ok
        );
    }

    #[test]
    fn replays_of_an_already_seen_sequence_number_are_duplicates() {
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        tracker.validate_data_record(&producer(0, 0), b"a");
        tracker.validate_data_record(&producer(0, 1), b"b");

        assert_eq!(
            tracker.validate_data_record(&producer(0, 1), b"b"),
            DivOutcome::Duplicate
        );
        assert_eq!(
            tracker.validate_data_record(&producer(0, 0), b"a"),
            DivOutcome::Duplicate
        );
    }

    #[test]
    fn a_sequence_gap_is_fatal() {
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        tracker.validate_data_record(&producer(0, 0), b"a");

        assert!(matches!(
            tracker.validate_data_record(&producer(0, 5), b"z"),
            DivOutcome::Fatal(_)
        ));
    }

    #[test]
    fn a_segment_may_start_at_a_nonzero_sequence_number() {
        // `[SOS seq=1, Put seq=1, Put seq=3]`: the segment's own starting
        // sequence number is the baseline, so the first Put at seq=1 is
        // accepted and only the second Put's gap to seq=3 is fatal.
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 1),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        assert_eq!(
            tracker.validate_data_record(&producer(0, 1), b"a"),
            DivOutcome::Ok
        );
        assert!(matches!(
            tracker.validate_data_record(&producer(0, 3), b"z"),
            DivOutcome::Fatal(_)
        ));
    }

    #[test]
    fn a_data_record_before_any_segment_start_is_fatal() {
        let tracker = DivTracker::new();
        assert!(matches!(
            tracker.validate_data_record(&producer(0, 0), b"a"),
            DivOutcome::Fatal(_)
        ));
    }

    #[test]
    fn a_data_record_after_end_of_segment_is_fatal() {
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::EndOfSegment,
            &BTreeMap::new(),
        );

        assert!(matches!(
            tracker.validate_data_record(&producer(0, 0), b"a"),
            DivOutcome::Fatal(_)
        ));
    }

    #[test]
    fn end_of_segment_checksum_matching_the_rolling_checksum_closes_cleanly() {
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        tracker.validate_data_record(&producer(0, 0), b"a");
        tracker.validate_data_record(&producer(0, 1), b"b");

        let expected = fold_checksum(fold_checksum(0, b"a"), b"b");
        let mut headers = BTreeMap::new();
        headers.insert(CHECKSUM_HEADER.to_string(), encode_checksum(expected));

        assert_eq!(
            tracker.validate_control_message(
                &producer(0, 0),
                ControlMessageType::EndOfSegment,
                &headers
            ),
            DivOutcome::Ok
        );
    }

    #[test]
    fn end_of_segment_checksum_mismatch_is_fatal() {
        let tracker = DivTracker::new();
        tracker.validate_control_message(
            &producer(0, 0),
            ControlMessageType::StartOfSegment,
            &BTreeMap::new(),
        );
        tracker.validate_data_record(&producer(0, 0), b"a");

        let mut headers = BTreeMap::new();
        headers.insert(CHECKSUM_HEADER.to_string(), encode_checksum(0xDEADBEEF));

        assert!(matches!(
            tracker.validate_control_message(
                &producer(0, 0),
                ControlMessageType::EndOfSegment,
                &headers
            ),
            DivOutcome::Fatal(_)
        ));
    }
}
