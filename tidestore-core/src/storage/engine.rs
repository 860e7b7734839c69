//! Storage - top-level coordinator of buckets, batches and queries

use super::{MetricsSnapshot, StorageConfig, StorageMetrics};
use crate::batch::{BatchManager, BatchManagerStats};
use crate::bucket::{BucketManager, BucketManagerStats};
use crate::column::{BucketQuery, ColumnStore};
use crate::{Record, Result, StoreError, StreamPartition, Timestamp};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Tidestore storage façade
///
/// Must be created inside a tokio runtime; the bucket and batch managers
/// run background tasks on it.
pub struct Storage {
    pub(super) store: Arc<dyn ColumnStore>,
    pub(super) buckets: Arc<BucketManager>,
    batches: BatchManager,
    pub(super) config: StorageConfig,
    pub(super) metrics: Arc<StorageMetrics>,
    cancel: CancellationToken,
    pending_stores: AtomicUsize,
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub buckets: BucketManagerStats,
    pub batches: BatchManagerStats,
    pub pending_stores: usize,
    pub metrics: MetricsSnapshot,
}

/// Counts a store while it waits for its bucket
struct PendingStore<'a>(&'a AtomicUsize);

impl<'a> PendingStore<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingStore<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Storage {
    /// Create a storage façade over a column store
    pub fn new(store: Arc<dyn ColumnStore>, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let buckets = BucketManager::new(Arc::clone(&store), config.bucket.clone())?;
        let batches = BatchManager::new(Arc::clone(&store), config.batch.clone())?;

        Ok(Self {
            store,
            buckets: Arc::new(buckets),
            batches,
            config,
            metrics: Arc::new(StorageMetrics::default()),
            cancel: CancellationToken::new(),
            pending_stores: AtomicUsize::new(0),
        })
    }

    /// Persist one record
    ///
    /// Resolves once the batch holding the record has been inserted. While
    /// the record's bucket is not yet known the lookup is retried every
    /// `retries_interval`. Fails with [`StoreError::BatchDropped`] if the
    /// batch exhausts its retries and with [`StoreError::Closed`] if the
    /// storage is closed first.
    pub async fn store(&self, record: Record) -> Result<()> {
        let key = record.stream_partition();

        loop {
            if self.cancel.is_cancelled() {
                return Err(StoreError::Closed);
            }

            if let Some(bucket_id) = self.buckets.get_bucket_id(&key, record.timestamp) {
                let size = record.size();
                let timestamp = record.timestamp;
                self.buckets.increment_bucket(bucket_id, size);

                let (done_tx, done_rx) = oneshot::channel();
                self.batches.store(
                    bucket_id,
                    record,
                    Box::new(move || {
                        let _ = done_tx.send(());
                    }),
                )?;

                return match done_rx.await {
                    Ok(()) => {
                        self.metrics.record_write(size);
                        Ok(())
                    }
                    Err(_) if self.cancel.is_cancelled() => Err(StoreError::Closed),
                    Err(_) => Err(StoreError::BatchDropped(format!(
                        "record at {} of {} in bucket {}",
                        timestamp, key, bucket_id
                    ))),
                };
            }

            trace!("Bucket for {} at {} not found, retrying", key, record.timestamp);
            let _pending = PendingStore::enter(&self.pending_stores);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StoreError::Closed),
                _ = tokio::time::sleep(self.config.retries_interval) => {}
            }
        }
    }

    /// Stores waiting for their bucket to be resolved
    pub fn pending_stores(&self) -> usize {
        self.pending_stores.load(Ordering::SeqCst)
    }

    /// Timestamp of the first message of a stream-partition, 0 if empty
    pub async fn first_message_timestamp(&self, stream: &StreamPartition) -> Result<Timestamp> {
        self.boundary_message_timestamp(stream, BucketQuery::Oldest, true)
            .await
    }

    /// Timestamp of the last message of a stream-partition, 0 if empty
    pub async fn last_message_timestamp(&self, stream: &StreamPartition) -> Result<Timestamp> {
        let newest = BucketQuery::Latest {
            limit: 1,
            at_or_before: None,
        };
        self.boundary_message_timestamp(stream, newest, false).await
    }

    async fn boundary_message_timestamp(
        &self,
        stream: &StreamPartition,
        query: BucketQuery,
        ascending: bool,
    ) -> Result<Timestamp> {
        let buckets = self.store.query_buckets(stream, query).await?;
        let Some(bucket) = buckets.first() else {
            return Ok(0);
        };
        let ts = self
            .store
            .boundary_timestamp(stream, bucket.id, ascending)
            .await?;
        Ok(ts.unwrap_or(0))
    }

    /// Messages accounted to a stream-partition's persisted buckets
    pub async fn message_count(&self, stream: &StreamPartition) -> Result<u64> {
        let buckets = self.all_buckets(stream).await?;
        Ok(buckets.iter().map(|b| b.records).sum())
    }

    /// Payload bytes accounted to a stream-partition's persisted buckets
    pub async fn total_bytes(&self, stream: &StreamPartition) -> Result<u64> {
        let buckets = self.all_buckets(stream).await?;
        Ok(buckets.iter().map(|b| b.size).sum())
    }

    async fn all_buckets(&self, stream: &StreamPartition) -> Result<Vec<crate::column::BucketRow>> {
        let everything = BucketQuery::Range {
            after: None,
            until: None,
        };
        self.store.query_buckets(stream, everything).await
    }

    /// Snapshot of the read and write counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            buckets: self.buckets.stats(),
            batches: self.batches.stats(),
            pending_stores: self.pending_stores(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Shut down: cancel pending stores, stop the bucket passes and drop
    /// every batch without waiting for running inserts
    pub fn close(&self) {
        debug!(
            "Closing storage ({} pending stores)",
            self.pending_stores()
        );
        self.cancel.cancel();
        self.buckets.stop();
        self.batches.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::bucket::BucketConfig;
    use crate::column::MemoryColumnStore;
    use std::time::Duration;

    fn fast_config() -> StorageConfig {
        StorageConfig {
            bucket: BucketConfig {
                check_full_buckets_interval: Duration::from_millis(10),
                store_buckets_interval: Duration::from_millis(10),
                max_bucket_records: 10,
                ..Default::default()
            },
            batch: BatchConfig {
                close_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            retries_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn record(ts: Timestamp, payload: &str) -> Record {
        Record::new(
            &StreamPartition::new("s1", 0),
            ts,
            0,
            "publisher",
            "chain",
            payload.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_store_resolves_after_insert() {
        let storage = Storage::new(Arc::new(MemoryColumnStore::new()), fast_config()).unwrap();

        storage.store(record(1000, "hello")).await.unwrap();
        storage.store(record(2000, "world!")).await.unwrap();

        let metrics = storage.metrics();
        assert_eq!(metrics.messages_written, 2);
        assert_eq!(metrics.bytes_written, 11);
        assert_eq!(storage.pending_stores(), 0);
    }

    #[tokio::test]
    async fn test_stream_details() {
        let storage = Storage::new(Arc::new(MemoryColumnStore::new()), fast_config()).unwrap();
        let key = StreamPartition::new("s1", 0);

        assert_eq!(storage.first_message_timestamp(&key).await.unwrap(), 0);
        assert_eq!(storage.last_message_timestamp(&key).await.unwrap(), 0);
        assert_eq!(storage.message_count(&key).await.unwrap(), 0);
        assert_eq!(storage.total_bytes(&key).await.unwrap(), 0);

        for ts in [1000, 2000, 3000] {
            storage.store(record(ts, "abcd")).await.unwrap();
        }
        // Counters are persisted write-behind
        for _ in 0..200 {
            if storage.message_count(&key).await.unwrap() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(storage.first_message_timestamp(&key).await.unwrap(), 1000);
        assert_eq!(storage.last_message_timestamp(&key).await.unwrap(), 3000);
        assert_eq!(storage.message_count(&key).await.unwrap(), 3);
        assert_eq!(storage.total_bytes(&key).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_store() {
        let mut config = fast_config();
        config.bucket.check_full_buckets_interval = Duration::from_secs(3600);
        let storage = Arc::new(Storage::new(Arc::new(MemoryColumnStore::new()), config).unwrap());
        // Let the initial allocation pass run before any record is pending
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.store(record(1000, "x")).await })
        };
        for _ in 0..200 {
            if storage.pending_stores() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(storage.pending_stores(), 1);

        storage.close();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(StoreError::Closed)));
        assert!(storage.is_closed());
        assert!(matches!(storage.store(record(2000, "y")).await, Err(StoreError::Closed)));
    }
}
