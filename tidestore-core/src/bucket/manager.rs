//! Bucket manager - resolves timestamps to buckets and persists counters

use super::{Bucket, BucketConfig, BucketIndex};
use crate::column::{BucketQuery, BucketRow, ColumnStore};
use crate::{BucketId, Result, StoreError, StreamPartition, Timestamp};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Owner of every in-memory bucket
///
/// All bucket mutation happens under `state` and never across an await,
/// so each bucket has exactly one writer at a time.
pub struct BucketManager {
    inner: Arc<ManagerInner>,
    cancel: CancellationToken,
}

struct ManagerInner {
    store: Arc<dyn ColumnStore>,
    config: BucketConfig,
    state: Mutex<ManagerState>,
    // Keeps manual and background passes from overlapping
    check_pass: tokio::sync::Mutex<()>,
    store_pass: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    indexes: HashMap<StreamPartition, BucketIndex>,
    buckets: HashMap<BucketId, Bucket>,
}

impl ManagerState {
    /// The tracked bucket that can take a record at `timestamp`
    fn find_bucket_id(&self, key: &StreamPartition, timestamp: Timestamp) -> Option<BucketId> {
        let index = self.indexes.get(key)?;
        let latest = self.buckets.get(&index.latest()?)?;

        if !latest.is_full() && latest.date_create() <= timestamp {
            return Some(latest.id());
        }
        if latest.date_create() > timestamp {
            // Late record: fall back to older buckets, newest first
            return index
                .newest_first()
                .into_iter()
                .skip(1)
                .find(|(_, date_create)| *date_create <= timestamp)
                .map(|(id, _)| id);
        }
        None
    }

    fn latest_bucket(&self, key: &StreamPartition) -> Option<&Bucket> {
        let index = self.indexes.get(key)?;
        self.buckets.get(&index.latest()?)
    }

    /// Track a bucket found in the column store unless it is already known
    fn adopt(&mut self, key: &StreamPartition, bucket: Option<Bucket>) -> bool {
        let Some(bucket) = bucket else {
            return false;
        };
        if self.buckets.contains_key(&bucket.id()) {
            return false;
        }
        let Some(index) = self.indexes.get_mut(key) else {
            return false;
        };

        trace!("Adopted stored bucket {} for {}", bucket.id(), key);
        index.push(bucket.id(), bucket.date_create());
        index.clear_pending();
        self.buckets.insert(bucket.id(), bucket);
        true
    }

    fn remove_bucket(&mut self, id: BucketId) {
        if let Some(bucket) = self.buckets.remove(&id) {
            if let Some(index) = self.indexes.get_mut(&bucket.stream_partition()) {
                index.remove(id);
            }
        }
    }
}

/// Bucket manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketManagerStats {
    /// Stream-partitions with an index
    pub stream_partitions: usize,
    /// Stream-partitions waiting for a bucket
    pub pending_partitions: usize,
    /// Buckets held in memory
    pub buckets: usize,
    /// Buckets whose counters are not yet persisted
    pub unstored_buckets: usize,
}

impl BucketManager {
    /// Create a manager and start both background passes
    pub fn new(store: Arc<dyn ColumnStore>, config: BucketConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(ManagerInner {
            store,
            config,
            state: Mutex::new(ManagerState::default()),
            check_pass: tokio::sync::Mutex::new(()),
            store_pass: tokio::sync::Mutex::new(()),
        });
        let cancel = CancellationToken::new();

        let check_interval = inner.config.check_full_buckets_interval;
        Self::spawn_pass(Arc::clone(&inner), cancel.clone(), check_interval, |inner| {
            async move { inner.check_full_buckets().await }.boxed()
        });
        let store_interval = inner.config.store_buckets_interval;
        Self::spawn_pass(Arc::clone(&inner), cancel.clone(), store_interval, |inner| {
            async move { inner.store_buckets().await }.boxed()
        });

        Ok(Self { inner, cancel })
    }

    /// Run `pass` now and again `interval` after each completion
    fn spawn_pass<F>(
        inner: Arc<ManagerInner>,
        cancel: CancellationToken,
        interval: Duration,
        pass: F,
    ) where
        F: Fn(Arc<ManagerInner>) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = pass(Arc::clone(&inner)) => {
                        if let Err(e) = result {
                            warn!("Bucket pass failed: {}", e);
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Resolve the bucket a record at `timestamp` belongs to
    ///
    /// Returns `None` when no tracked bucket can take it yet; the timestamp
    /// is then remembered and the next allocation pass provides a bucket.
    pub fn get_bucket_id(
        &self,
        stream: &StreamPartition,
        timestamp: Timestamp,
    ) -> Option<BucketId> {
        let mut state = self.inner.state.lock();

        if !state.indexes.contains_key(stream) {
            trace!("Create new index for {} (stream not found)", stream);
            state
                .indexes
                .insert(stream.clone(), BucketIndex::pending(timestamp));
            return None;
        }

        trace!("Found index for {}, checking timestamp {}", stream, timestamp);
        let found = state.find_bucket_id(stream, timestamp);
        if found.is_none() {
            if let Some(index) = state.indexes.get_mut(stream) {
                index.note_pending(timestamp);
            }
        }
        found
    }

    /// Account one record of `size` bytes to a bucket
    pub fn increment_bucket(&self, id: BucketId, size: u64) {
        let mut state = self.inner.state.lock();
        match state.buckets.get_mut(&id) {
            Some(bucket) => bucket.increment_bucket(size),
            None => warn!("Failed to increment bucket {} (bucket not found)", id),
        }
    }

    /// Buckets that may hold data between `from` and `to`, newest first
    ///
    /// With `from` set, the newest bucket created at or before `from` is
    /// appended, since data at `from` can live in an earlier bucket.
    pub async fn get_buckets_by_timestamp(
        &self,
        stream: &StreamPartition,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<Bucket>> {
        self.inner.get_buckets_by_timestamp(stream, from, to).await
    }

    /// The newest `limit` buckets, optionally only those created at or
    /// before `before`
    pub async fn get_last_buckets(
        &self,
        stream: &StreamPartition,
        limit: usize,
        before: Option<Timestamp>,
    ) -> Result<Vec<Bucket>> {
        self.inner.get_last_buckets(stream, limit, before).await
    }

    /// Allocate buckets for every pending timestamp
    pub async fn check_full_buckets(&self) -> Result<()> {
        self.inner.check_full_buckets().await
    }

    /// Persist dirty counters and evict expired buckets
    pub async fn store_buckets(&self) -> Result<()> {
        self.inner.store_buckets().await
    }

    /// Snapshot of a tracked bucket
    pub fn bucket(&self, id: BucketId) -> Option<Bucket> {
        self.inner.state.lock().buckets.get(&id).cloned()
    }

    /// Cancel both background passes
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Stopping bucket manager");
            self.cancel.cancel();
        }
    }

    /// Get manager statistics
    pub fn stats(&self) -> BucketManagerStats {
        let state = self.inner.state.lock();
        BucketManagerStats {
            stream_partitions: state.indexes.len(),
            pending_partitions: state
                .indexes
                .values()
                .filter(|index| index.min_timestamp().is_some())
                .count(),
            buckets: state.buckets.len(),
            unstored_buckets: state.buckets.values().filter(|b| !b.is_stored()).count(),
        }
    }
}

impl Drop for BucketManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ManagerInner {
    async fn get_buckets_by_timestamp(
        &self,
        stream: &StreamPartition,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<Bucket>> {
        match (from, to) {
            (Some(from), to) => {
                let rest = self.query(stream, BucketQuery::Range { after: Some(from), until: to });
                let first = self.query(
                    stream,
                    BucketQuery::Latest {
                        limit: 1,
                        at_or_before: Some(from),
                    },
                );
                let (rest, first) = futures::try_join!(rest, first)?;
                Ok(rest.into_iter().chain(first).collect())
            }
            (None, Some(to)) => {
                self.query(stream, BucketQuery::Range { after: None, until: Some(to) })
                    .await
            }
            (None, None) => Err(StoreError::Validation(
                "bucket lookup needs a from or to timestamp".into(),
            )),
        }
    }

    async fn get_last_buckets(
        &self,
        stream: &StreamPartition,
        limit: usize,
        before: Option<Timestamp>,
    ) -> Result<Vec<Bucket>> {
        self.query(
            stream,
            BucketQuery::Latest {
                limit,
                at_or_before: before,
            },
        )
        .await
    }

    async fn query(&self, stream: &StreamPartition, query: BucketQuery) -> Result<Vec<Bucket>> {
        let rows = self.store.query_buckets(stream, query).await?;
        rows.iter()
            .map(|row| Bucket::from_row(row, &self.config))
            .collect()
    }

    async fn check_full_buckets(&self) -> Result<()> {
        let _pass = self.check_pass.lock().await;

        let pending: Vec<(StreamPartition, Timestamp)> = {
            let state = self.state.lock();
            state
                .indexes
                .iter()
                .filter_map(|(key, index)| index.min_timestamp().map(|ts| (key.clone(), ts)))
                .collect()
        };

        for (key, min_timestamp) in pending {
            if let Err(e) = self.resolve_pending(&key, min_timestamp).await {
                warn!("Failed to allocate bucket for {}: {}", key, e);
            }
        }
        Ok(())
    }

    async fn resolve_pending(&self, key: &StreamPartition, min_timestamp: Timestamp) -> Result<()> {
        let latest_almost_full = self.state.lock().latest_bucket(key).map(Bucket::is_almost_full);
        let mut insert_new = latest_almost_full.unwrap_or(false);

        // No usable bucket in memory: the store may know a newer one
        if latest_almost_full.unwrap_or(true) {
            let found = self.get_last_buckets(key, 1, None).await?;
            let adopted = self.state.lock().adopt(key, found.into_iter().next());
            insert_new |= !adopted;
        }

        let covered = self.state.lock().find_bucket_id(key, min_timestamp).is_some();
        if !insert_new && !covered {
            let found = self.get_last_buckets(key, 1, Some(min_timestamp)).await?;
            let adopted = self.state.lock().adopt(key, found.into_iter().next());
            insert_new |= !adopted;
        }

        if insert_new {
            trace!(
                "Create new bucket for {} at {} (existing bucket for timestamp not found)",
                key,
                min_timestamp
            );
            let bucket = Bucket::new(
                BucketId::generate(min_timestamp),
                key,
                0,
                0,
                min_timestamp,
                &self.config,
            )?;

            let mut state = self.state.lock();
            if let Some(index) = state.indexes.get_mut(key) {
                index.push(bucket.id(), bucket.date_create());
                index.clear_pending();
            }
            state.buckets.insert(bucket.id(), bucket);
        }
        Ok(())
    }

    async fn store_buckets(&self) -> Result<()> {
        let _pass = self.store_pass.lock().await;

        let dirty: Vec<BucketRow> = {
            let state = self.state.lock();
            state
                .buckets
                .values()
                .filter(|b| !b.is_stored())
                .map(Bucket::to_row)
                .collect()
        };

        let results = join_all(dirty.into_iter().map(|row| async move {
            let result = self.store.upsert_bucket(row.clone()).await;
            (row, result)
        }))
        .await;

        let mut state = self.state.lock();
        for (row, result) in results {
            match result {
                Ok(()) => {
                    if let Some(bucket) = state.buckets.get_mut(&row.id) {
                        // Writes that landed during the upsert keep it dirty
                        if bucket.records() == row.records {
                            bucket.set_stored();
                        }
                    }
                }
                Err(e) => warn!("Failed to store bucket {}: {}", row.id, e),
            }
        }

        let expired: Vec<BucketId> = state
            .buckets
            .values()
            .filter(|b| b.is_stored() && !b.is_alive())
            .map(Bucket::id)
            .collect();
        for id in expired {
            trace!("Evicting bucket {}", id);
            state.remove_bucket(id);
        }
        Ok(())
    }
}
