//! Active/Active Merge & View Fan-out (§4.F). Resolves conflicts against the
//! prior value + RMD, fans out to view writers concurrently, and preserves
//! the version topic's causal order across concurrent view fan-out by
//! gating every produce on the previous one's queued-future (§5 ordering
//! guarantees).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::error::{PartitionIngestionError, SharedIngestionError};
use crate::interfaces::{StorageEngine, ViewWriter};
use crate::pcs::{GatingFuture, PartitionConsumptionState};
use crate::record::ReplicationMetadata;
use crate::stats::StatsSink;

/// Prior value + RMD as seen by the merge step, whether served from the
/// transient cache or a disk read (§4.F step 1).
#[derive(Debug, Clone)]
pub struct PriorValue {
    pub value: Bytes,
    pub rmd: ReplicationMetadata,
}

/// What `merge()` decided (§4.F step 2).
#[derive(Debug, Clone)]
pub enum MergeConflictResult {
    /// The incoming write lost the conflict; nothing changes.
    UpdateIgnored,
    /// The incoming write wins; `new_value` replaces the old one, carrying
    /// the updated RMD.
    NewPutWithRmd {
        new_value: Bytes,
        new_rmd: ReplicationMetadata,
        old_value: Option<Bytes>,
        old_rmd: Option<ReplicationMetadata>,
    },
    /// The incoming write is a delete that wins the conflict.
    TombstoneWithRmd {
        new_rmd: ReplicationMetadata,
        old_value: Option<Bytes>,
        old_rmd: Option<ReplicationMetadata>,
    },
}

/// An incoming data record as seen by the merge step, already DIV-validated.
#[derive(Debug, Clone)]
pub struct IncomingWrite {
    pub key: Bytes,
    pub new_value: Option<Bytes>,
    pub new_schema_id: Option<i32>,
    pub incoming_rmd: ReplicationMetadata,
}

/// Resolves `incoming` against `prior`, purely by RMD comparison (version id
/// then payload byte order as the tie-break, matching the documented
/// requirement that conflict resolution must be a total order so every
/// replica converges on the same winner).
pub fn merge(incoming: &IncomingWrite, prior: Option<&PriorValue>) -> MergeConflictResult {
    let prior_wins = match prior {
        Some(prior) => {
            let incoming_version = incoming.incoming_rmd.version_id;
            let prior_version = prior.rmd.version_id;
            match incoming_version.cmp(&prior_version) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => incoming.incoming_rmd.payload <= prior.rmd.payload,
            }
        }
        None => false,
    };

    if prior_wins {
        return MergeConflictResult::UpdateIgnored;
    }

    let old_value = prior.map(|p| p.value.clone());
    let old_rmd = prior.map(|p| p.rmd.clone());
    match &incoming.new_value {
        Some(new_value) => MergeConflictResult::NewPutWithRmd {
            new_value: new_value.clone(),
            new_rmd: incoming.incoming_rmd.clone(),
            old_value,
            old_rmd,
        },
        None => MergeConflictResult::TombstoneWithRmd {
            new_rmd: incoming.incoming_rmd.clone(),
            old_value,
            old_rmd,
        },
    }
}

/// Per-partition cache of prior value+RMD, used to skip a disk read between
/// closely spaced writes to the same key (§9). Must only be updated under
/// the key lock; entries may be evicted on lock release once a key is no
/// longer hot.
#[derive(Debug, Default)]
pub struct PriorValueCache {
    entries: Mutex<HashMap<Bytes, PriorValue>>,
}

impl PriorValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Bytes) -> Option<PriorValue> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: Bytes, value: PriorValue) {
        self.entries.lock().insert(key, value);
    }

    pub fn invalidate(&self, key: &Bytes) {
        self.entries.lock().remove(key);
    }

    /// Called on key-lock release; drops the entry so a cold key doesn't
    /// pin memory indefinitely (§9: "eviction on key-lock release ... is
    /// optional but recommended").
    pub fn evict_on_release(&self, key: &Bytes) {
        self.invalidate(key);
    }
}

/// Looks up the prior value+RMD for `key`, preferring `cache` and falling
/// back to a single storage read on a miss (§4.F step 1, §9 transient
/// cache). Shared by the batch path and the single-record A/A path so both
/// agree on cache population.
pub async fn resolve_prior_value(
    cache: &PriorValueCache,
    storage: &dyn StorageEngine,
    partition: i32,
    key: &Bytes,
) -> Option<PriorValue> {
    if let Some(prior) = cache.get(key) {
        return Some(prior);
    }
    storage
        .get(partition, key)
        .await
        .ok()
        .flatten()
        .map(|(value, rmd)| PriorValue { value, rmd })
}

/// Fans `result` out to every view writer in parallel, then gates the
/// caller-supplied `produce` future on both the previous VT produce future
/// and all view futures completing (§4.F steps 4-5), and installs the new
/// composite as `pcs.last_vt_produce_future` before it resolves so the next
/// record observes it (§4.F: "Update ... before it resolves").
pub fn fan_out_and_produce(
    pcs: &PartitionConsumptionState,
    views: &[Arc<dyn ViewWriter>],
    key: Bytes,
    new_value: Option<Bytes>,
    old_value: Option<Bytes>,
    version: i32,
    new_schema_id: Option<i32>,
    old_schema_id: Option<i32>,
    rmd: ReplicationMetadata,
    produce: impl FnOnce() -> GatingFuture + Send + 'static,
) -> GatingFuture {
    let previous_vt_future = pcs.vt_produce_future();

    let view_futures: Vec<BoxFuture<'static, Result<(), PartitionIngestionError>>> = views
        .iter()
        .map(|view| {
            let view = view.clone();
            let key = key.clone();
            let new_value = new_value.clone();
            let old_value = old_value.clone();
            let rmd = rmd.clone();
            async move {
                view.process_record(
                    new_value.as_ref(),
                    old_value.as_ref(),
                    &key,
                    version,
                    new_schema_id,
                    old_schema_id,
                    &rmd,
                )
                .await
            }
            .boxed()
        })
        .collect();

    let composite: GatingFuture = async move {
        previous_vt_future.await?;
        for view_future in view_futures {
            view_future.await.map_err(Arc::new)?;
        }
        produce().await
    }
    .boxed()
    .shared();

    pcs.set_vt_produce_future(composite.clone());
    composite
}

/// Applies a resolved [`MergeConflictResult`], recording tombstone stats as
/// needed, and returns whether a produce should happen at all (§4.F step 3:
/// an ignored update never produces).
pub fn should_produce(result: &MergeConflictResult, stats: &dyn StatsSink) -> bool {
    match result {
        MergeConflictResult::UpdateIgnored => false,
        MergeConflictResult::NewPutWithRmd { .. } => true,
        MergeConflictResult::TombstoneWithRmd { .. } => {
            stats.record_tombstone_created_dcr();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcs::Role;
    use crate::stats::NullStatsSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rmd(version_id: i32, payload: &'static [u8]) -> ReplicationMetadata {
        ReplicationMetadata {
            payload: Bytes::from_static(payload),
            version_id,
        }
    }

    #[test]
    fn a_higher_rmd_version_wins_the_conflict() {
        let incoming = IncomingWrite {
            key: Bytes::from_static(b"k"),
            new_value: Some(Bytes::from_static(b"new")),
            new_schema_id: Some(1),
            incoming_rmd: rmd(5, b"x"),
        };
        let prior = PriorValue {
            value: Bytes::from_static(b"old"),
            rmd: rmd(4, b"x"),
        };
        let result = merge(&incoming, Some(&prior));
        assert!(matches!(result, MergeConflictResult::NewPutWithRmd { .. }));
    }

    #[test]
    fn a_lower_rmd_version_is_ignored() {
        let incoming = IncomingWrite {
            key: Bytes::from_static(b"k"),
            new_value: Some(Bytes::from_static(b"new")),
            new_schema_id: Some(1),
            incoming_rmd: rmd(3, b"x"),
        };
        let prior = PriorValue {
            value: Bytes::from_static(b"old"),
            rmd: rmd(4, b"x"),
        };
        let result = merge(&incoming, Some(&prior));
        assert!(matches!(result, MergeConflictResult::UpdateIgnored));
    }

    #[test]
    fn a_delete_that_wins_produces_a_tombstone() {
        let incoming = IncomingWrite {
            key: Bytes::from_static(b"k"),
            new_value: None,
            new_schema_id: None,
            incoming_rmd: rmd(5, b"x"),
        };
        let prior = PriorValue {
            value: Bytes::from_static(b"old"),
            rmd: rmd(4, b"x"),
        };
        let result = merge(&incoming, Some(&prior));
        assert!(matches!(result, MergeConflictResult::TombstoneWithRmd { .. }));
    }

    #[test]
    fn a_write_with_no_prior_value_always_wins() {
        let incoming = IncomingWrite {
            key: Bytes::from_static(b"k"),
            new_value: Some(Bytes::from_static(b"new")),
            new_schema_id: Some(1),
            incoming_rmd: rmd(0, b"x"),
        };
        assert!(matches!(
            merge(&incoming, None),
            MergeConflictResult::NewPutWithRmd { .. }
        ));
    }

    #[derive(Debug)]
    struct RecordingView {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ViewWriter for RecordingView {
        async fn process_record(
            &self,
            _new_value: Option<&Bytes>,
            _old_value: Option<&Bytes>,
            _key: &Bytes,
            _version: i32,
            _new_schema_id: Option<i32>,
            _old_schema_id: Option<i32>,
            _rmd: &ReplicationMetadata,
        ) -> Result<(), PartitionIngestionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn every_view_writer_is_invoked_and_the_vt_future_advances() {
        let pcs = PartitionConsumptionState::new("store_v1_rt", 0, Role::Leader);
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let views: Vec<Arc<dyn ViewWriter>> = vec![
            Arc::new(RecordingView {
                calls: calls_a.clone(),
            }),
            Arc::new(RecordingView {
                calls: calls_b.clone(),
            }),
        ];

        let produced = Arc::new(AtomicUsize::new(0));
        let produced_for_closure = produced.clone();
        let composite = fan_out_and_produce(
            &pcs,
            &views,
            Bytes::from_static(b"k"),
            Some(Bytes::from_static(b"new")),
            Some(Bytes::from_static(b"old")),
            1,
            Some(1),
            Some(1),
            rmd(5, b"x"),
            move || {
                produced_for_closure.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(())).boxed().shared()
            },
        );

        composite.await.unwrap();
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_produce_is_false_only_for_ignored_updates() {
        let stats = NullStatsSink;
        assert!(!should_produce(&MergeConflictResult::UpdateIgnored, &stats));
        assert!(should_produce(
            &MergeConflictResult::TombstoneWithRmd {
                new_rmd: rmd(1, b"x"),
                old_value: None,
                old_rmd: None,
            },
            &stats
        ));
    }
}
