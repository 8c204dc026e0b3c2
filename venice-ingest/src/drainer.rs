//! Drainer Interface (§4.H): a bounded queue of processed records to be
//! applied to the storage engine. The core blocks under backpressure here;
//! that blocking is acceptable but must be interruptible (§5).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::interfaces::StorageEngine;
use crate::record::ReplicationMetadata;

/// One item applied to local storage. `value: None` means a tombstone
/// (delete).
#[derive(Debug, Clone)]
pub struct DrainerItem {
    pub partition: i32,
    pub upstream_url: String,
    pub timestamp_ms: i64,
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub replication_metadata: Option<ReplicationMetadata>,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("drainer queue is closed")]
pub struct DrainerClosed;

/// The consumed capability (§6, §4.H). `put` asserts only FIFO per
/// partition, not a global order.
#[async_trait]
pub trait Drainer: Debug + Send + Sync + 'static {
    async fn put(&self, item: DrainerItem) -> Result<(), DrainerClosed>;
}

/// A bounded, in-process drainer. Mirrors the teacher crate's pattern of a
/// channel-backed worker with a background apply task, adapted from a
/// persist-task spawn to a permanently running apply loop (§4.H has no
/// notion of a one-shot persist job).
#[derive(Debug)]
pub struct BoundedDrainer {
    sender: mpsc::Sender<DrainerItem>,
}

impl BoundedDrainer {
    /// Spawns the apply loop and returns the drainer handle plus its
    /// `JoinHandle`, so callers can await clean shutdown after cancelling
    /// `token`.
    pub fn spawn(
        capacity: usize,
        storage: Arc<dyn StorageEngine>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_drainer(receiver, storage, token));
        (Self { sender }, handle)
    }
}

#[async_trait]
impl Drainer for BoundedDrainer {
    async fn put(&self, item: DrainerItem) -> Result<(), DrainerClosed> {
        self.sender.send(item).await.map_err(|_| DrainerClosed)
    }
}

async fn run_drainer(
    mut receiver: mpsc::Receiver<DrainerItem>,
    storage: Arc<dyn StorageEngine>,
    token: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("drainer shutting down on cancellation");
                break;
            }
            item = receiver.recv() => item,
        };
        let Some(item) = item else {
            info!("drainer channel closed, exiting");
            break;
        };

        let result = match item.value {
            Some(value) => {
                storage
                    .put(
                        item.partition,
                        item.key.clone(),
                        value,
                        item.replication_metadata.clone(),
                    )
                    .await
            }
            None => {
                storage
                    .delete(
                        item.partition,
                        item.key.clone(),
                        item.replication_metadata.clone(),
                    )
                    .await
            }
        };
        if let Err(err) = result {
            error!(partition = item.partition, %err, "failed to apply drained record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::interfaces::StoreVersionState;

    #[derive(Debug, Default)]
    struct RecordingStorage {
        puts: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl StorageEngine for RecordingStorage {
        async fn get(
            &self,
            _partition: i32,
            _key: &[u8],
        ) -> Result<Option<(Bytes, ReplicationMetadata)>, crate::error::PartitionIngestionError>
        {
            Ok(None)
        }

        async fn get_store_version_state(&self, _partition: i32) -> Option<StoreVersionState> {
            None
        }

        async fn put(
            &self,
            _partition: i32,
            _key: Bytes,
            _value: Bytes,
            _rmd: Option<ReplicationMetadata>,
        ) -> Result<(), crate::error::PartitionIngestionError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(
            &self,
            _partition: i32,
            _key: Bytes,
            _rmd: Option<ReplicationMetadata>,
        ) -> Result<(), crate::error::PartitionIngestionError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn puts_and_deletes_are_applied_in_order() {
        let storage = Arc::new(RecordingStorage::default());
        let token = CancellationToken::new();
        let (drainer, handle) = BoundedDrainer::spawn(4, storage.clone(), token.clone());

        drainer
            .put(DrainerItem {
                partition: 0,
                upstream_url: "local".into(),
                timestamp_ms: 1,
                key: Bytes::from_static(b"k"),
                value: Some(Bytes::from_static(b"v")),
                replication_metadata: None,
            })
            .await
            .unwrap();
        drainer
            .put(DrainerItem {
                partition: 0,
                upstream_url: "local".into(),
                timestamp_ms: 2,
                key: Bytes::from_static(b"k"),
                value: None,
                replication_metadata: None,
            })
            .await
            .unwrap();

        // Give the background task a chance to drain before shutting down.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_after_shutdown_reports_closed() {
        let storage = Arc::new(RecordingStorage::default());
        let token = CancellationToken::new();
        let (drainer, handle) = BoundedDrainer::spawn(4, storage, token.clone());
        token.cancel();
        handle.await.unwrap();

        let result = drainer
            .put(DrainerItem {
                partition: 0,
                upstream_url: "local".into(),
                timestamp_ms: 1,
                key: Bytes::from_static(b"k"),
                value: Some(Bytes::from_static(b"v")),
                replication_metadata: None,
            })
            .await;
        assert!(result.is_err());
    }
}
