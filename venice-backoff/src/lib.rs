//! Fixed-interval cooperative polling.
//!
//! The ingestion pipeline has two suspension points that wait on some other
//! subsystem to catch up (schema registration, store-version state
//! materialization). Both share the same shape: sleep a fixed delay, check
//! again, give up after a fixed timeout. This crate is that shape, pulled out
//! so the two call sites don't drift.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_copy_implementations, missing_debug_implementations)]

use std::time::Duration;

use observability_deps::tracing::debug;

/// Returned by [`poll_until_ready`] when `predicate` never became true
/// within `timeout`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollTimedOut {
    /// Total time spent waiting before giving up.
    pub waited: Duration,
}

/// Configuration for a fixed-interval poll loop.
#[derive(Debug, Copy, Clone)]
pub struct PollConfig {
    /// How long to wait between polls of `predicate`.
    pub delay: Duration,
    /// Total time budget before giving up with [`PollTimedOut`].
    pub timeout: Duration,
}

/// Poll `predicate` every `config.delay` until it returns `true`, or until
/// `config.timeout` has elapsed, whichever comes first.
///
/// `predicate` is checked once immediately before the first sleep, so a
/// condition that is already satisfied never sleeps at all.
pub async fn poll_until_ready<F, Fut>(
    task_name: &str,
    config: PollConfig,
    mut predicate: F,
) -> Result<(), PollTimedOut>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();

    loop {
        if predicate().await {
            return Ok(());
        }

        let waited = start.elapsed();
        if waited >= config.timeout {
            return Err(PollTimedOut { waited });
        }

        debug!(task_name, waited_ms = waited.as_millis() as u64, "still waiting");
        tokio::time::sleep(config.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_predicate_flips() {
        let attempts = AtomicUsize::new(0);
        let config = PollConfig {
            delay: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        };

        let result = poll_until_ready("schema_availability", config, || async {
            attempts.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_if_never_ready() {
        let config = PollConfig {
            delay: Duration::from_millis(10),
            timeout: Duration::from_millis(35),
        };

        let result = poll_until_ready("schema_availability", config, || async { false }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn never_sleeps_if_already_ready() {
        let config = PollConfig {
            delay: Duration::from_secs(3600),
            timeout: Duration::from_secs(3600),
        };
        let result = poll_until_ready("version_state_available", config, || async { true }).await;
        assert!(result.is_ok());
    }
}
