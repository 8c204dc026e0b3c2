//! A small metrics registry.
//!
//! This is not a general-purpose metrics crate: it only implements the shape
//! the ingestion pipeline needs (named counters, broken down by a handful of
//! string attributes) so that `StatsSink` implementations can be backed by
//! something real in tests without pulling in an external metrics stack.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A set of attribute key/value pairs identifying one time series within a
/// named metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, &'static str>);

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(pairs.iter().copied().collect())
    }
}

/// A single monotonically increasing counter.
#[derive(Debug, Default)]
pub struct U64Counter(AtomicU64);

impl U64Counter {
    /// Increment the counter by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A named metric, which fans out into one [`U64Counter`] per distinct
/// [`Attributes`] value observed.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    recorders: Mutex<BTreeMap<Attributes, Arc<T>>>,
}

impl Metric<U64Counter> {
    /// Get (creating if necessary) the recorder for the given attributes.
    pub fn recorder(&self, attrs: impl Into<Attributes>) -> Arc<U64Counter> {
        let attrs = attrs.into();
        let mut recorders = self.recorders.lock();
        Arc::clone(
            recorders
                .entry(attrs)
                .or_insert_with(|| Arc::new(U64Counter::default())),
        )
    }

    /// Read back the recorder for the given attributes, if it has ever been
    /// observed. Intended for test assertions.
    pub fn get_observer(&self, attrs: &Attributes) -> Option<Arc<U64Counter>> {
        self.recorders.lock().get(attrs).cloned()
    }
}

/// A registry of named metrics.
///
/// Analogous in spirit to a null/no-op stats sink: cheap to construct, safe
/// to share across partition tasks, and queryable by tests.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<BTreeMap<&'static str, Arc<Metric<U64Counter>>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch an already-registered) counter metric under
    /// `name`. `description` is accepted for documentation purposes and
    /// intentionally not stored anywhere observable.
    pub fn register_metric(
        &self,
        name: &'static str,
        _description: &'static str,
    ) -> Arc<Metric<U64Counter>> {
        let mut metrics = self.metrics.lock();
        Arc::clone(metrics.entry(name).or_insert_with(|| {
            Arc::new(Metric {
                name,
                recorders: Mutex::new(BTreeMap::new()),
            })
        }))
    }

    /// Fetch a previously registered metric by name. Intended for test
    /// assertions; panics via `Option::expect` at the call site if the
    /// metric was never registered.
    pub fn get_instrument(&self, name: &str) -> Option<Arc<Metric<U64Counter>>> {
        self.metrics.lock().get(name).cloned()
    }
}
