//! Partition Consumption State (§3, §4.B): the authoritative mutable state
//! for one assigned partition. Owned by the partition's ingestion task;
//! producer callbacks only ever touch it through future completion or the
//! monotone counters below, never by holding a reference across an await
//! (§5 "Shared resources").

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use observability_deps::tracing::warn;
use parking_lot::Mutex;

use crate::error::SharedIngestionError;
use crate::interfaces::LogProducer;

/// A future every downstream-ordering chain gates on. Carries the error so a
/// failed view write can fail every VT produce queued behind it (§4.F, §7.6).
pub type GatingFuture = Shared<BoxFuture<'static, Result<(), SharedIngestionError>>>;

fn already_completed() -> GatingFuture {
    futures::future::ready(Ok(())).boxed().shared()
}

/// §3: `role ∈ {FOLLOWER, LEADER, IN_TRANSITION}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
    InTransition,
}

struct PcsInner {
    role: Role,
    end_of_push_received: bool,
    leader_offset_by_upstream: HashMap<String, i64>,
    latest_ignored_upstream_offset: HashMap<String, i64>,
    last_polled_ts_ms: i64,
    last_consumed_ts_ms: i64,
    last_vt_produce_future: GatingFuture,
    last_persist_future: GatingFuture,
    producer_handle: Option<Arc<dyn LogProducer>>,
    topic_switch: bool,
    is_hybrid: bool,
    is_batch_only: bool,
    is_data_recovery: bool,
    completion_reported: bool,
    fatal_error: Option<SharedIngestionError>,
}

/// One per assigned partition (§3).
pub struct PartitionConsumptionState {
    topic: String,
    partition: i32,
    inner: Mutex<PcsInner>,
}

impl std::fmt::Debug for PartitionConsumptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionConsumptionState")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

impl PartitionConsumptionState {
    pub fn new(topic: impl Into<String>, partition: i32, role: Role) -> Self {
        Self {
            topic: topic.into(),
            partition,
            inner: Mutex::new(PcsInner {
                role,
                end_of_push_received: false,
                leader_offset_by_upstream: HashMap::new(),
                latest_ignored_upstream_offset: HashMap::new(),
                last_polled_ts_ms: 0,
                last_consumed_ts_ms: 0,
                last_vt_produce_future: already_completed(),
                last_persist_future: already_completed(),
                producer_handle: None,
                topic_switch: false,
                is_hybrid: false,
                is_batch_only: true,
                is_data_recovery: false,
                completion_reported: false,
                fatal_error: None,
            }),
        }
    }

    /// Used for logging (§4.B).
    pub fn replica_id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn set_role(&self, role: Role) {
        self.inner.lock().role = role;
    }

    pub fn end_of_push_received(&self) -> bool {
        self.inner.lock().end_of_push_received
    }

    /// Monotone: once set, stays set (§3).
    pub fn mark_end_of_push_received(&self) {
        self.inner.lock().end_of_push_received = true;
    }

    /// Monotone non-decreasing per upstream URL; smaller values are rejected
    /// silently (§4.B).
    pub fn update_latest_ignored_upstream(&self, upstream_url: &str, offset: i64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .latest_ignored_upstream_offset
            .entry(upstream_url.to_string())
            .or_insert(i64::MIN);
        if offset > *entry {
            *entry = offset;
        }
    }

    pub fn latest_ignored_upstream(&self, upstream_url: &str) -> Option<i64> {
        self.inner
            .lock()
            .latest_ignored_upstream_offset
            .get(upstream_url)
            .copied()
    }

    /// Monotone non-decreasing per upstream URL; smaller values are rejected
    /// silently (§4.B: `update_latest_rt_offset_tried_to_produce`).
    pub fn update_latest_rt_offset_tried_to_produce(&self, upstream_url: &str, offset: i64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .leader_offset_by_upstream
            .entry(upstream_url.to_string())
            .or_insert(i64::MIN);
        if offset > *entry {
            *entry = offset;
        } else if offset < *entry {
            warn!(
                upstream_url,
                offset, current = *entry, "ignoring out-of-order offset update"
            );
        }
    }

    pub fn leader_offset_by_upstream(&self, upstream_url: &str) -> Option<i64> {
        self.inner
            .lock()
            .leader_offset_by_upstream
            .get(upstream_url)
            .copied()
    }

    pub fn last_polled_ts_ms(&self) -> i64 {
        self.inner.lock().last_polled_ts_ms
    }

    pub fn set_last_polled_ts_ms(&self, ts: i64) {
        self.inner.lock().last_polled_ts_ms = ts;
    }

    pub fn last_consumed_ts_ms(&self) -> i64 {
        self.inner.lock().last_consumed_ts_ms
    }

    pub fn set_last_consumed_ts_ms(&self, ts: i64) {
        self.inner.lock().last_consumed_ts_ms = ts;
    }

    pub fn vt_produce_future(&self) -> GatingFuture {
        self.inner.lock().last_vt_produce_future.clone()
    }

    pub fn set_vt_produce_future(&self, fut: GatingFuture) {
        self.inner.lock().last_vt_produce_future = fut;
    }

    pub fn persist_future(&self) -> GatingFuture {
        self.inner.lock().last_persist_future.clone()
    }

    pub fn set_persist_future(&self, fut: GatingFuture) {
        self.inner.lock().last_persist_future = fut;
    }

    /// Lazily materializes the producer handle via `init` on first use,
    /// guarded by the inner lock so concurrent first-uses only construct one
    /// (§9 "lazy producer handle").
    pub fn producer_handle_or_init(
        &self,
        init: impl FnOnce() -> Arc<dyn LogProducer>,
    ) -> Arc<dyn LogProducer> {
        let mut inner = self.inner.lock();
        if inner.producer_handle.is_none() {
            inner.producer_handle = Some(init());
        }
        inner.producer_handle.clone().expect("just initialized")
    }

    /// Swaps in a new producer handle (§4.E: EOP swaps VT handle for the
    /// real-time one).
    pub fn set_producer_handle(&self, handle: Arc<dyn LogProducer>) {
        self.inner.lock().producer_handle = Some(handle);
    }

    pub fn topic_switch(&self) -> bool {
        self.inner.lock().topic_switch
    }

    pub fn set_topic_switch(&self, value: bool) {
        self.inner.lock().topic_switch = value;
    }

    pub fn is_hybrid(&self) -> bool {
        self.inner.lock().is_hybrid
    }

    pub fn set_is_hybrid(&self, value: bool) {
        self.inner.lock().is_hybrid = value;
    }

    pub fn is_batch_only(&self) -> bool {
        self.inner.lock().is_batch_only
    }

    pub fn set_is_batch_only(&self, value: bool) {
        self.inner.lock().is_batch_only = value;
    }

    pub fn is_data_recovery(&self) -> bool {
        self.inner.lock().is_data_recovery
    }

    pub fn set_is_data_recovery(&self, value: bool) {
        self.inner.lock().is_data_recovery = value;
    }

    pub fn completion_reported(&self) -> bool {
        self.inner.lock().completion_reported
    }

    pub fn set_completion_reported(&self, value: bool) {
        self.inner.lock().completion_reported = value;
    }

    /// Set once by a fatal error (§7); later `write()` calls surface it
    /// instead of processing further records. Never cleared.
    pub fn set_fatal_error(&self, error: SharedIngestionError) {
        let mut inner = self.inner.lock();
        if inner.fatal_error.is_none() {
            inner.fatal_error = Some(error);
        }
    }

    pub fn fatal_error(&self) -> Option<SharedIngestionError> {
        self.inner.lock().fatal_error.clone()
    }
}
