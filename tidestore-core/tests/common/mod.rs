//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidestore_core::batch::BatchConfig;
use tidestore_core::bucket::BucketConfig;
use tidestore_core::column::{
    BucketIdPage, BucketQuery, BucketRow, ColumnStore, DataQuery, DataRow, MemoryColumnStore,
    PageState, RowStream,
};
use tidestore_core::storage::StorageConfig;
use tidestore_core::{BucketId, Record, Result, StoreError, StreamPartition, Timestamp};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short intervals so background passes run many times per test
pub fn fast_config(max_bucket_records: u64) -> StorageConfig {
    StorageConfig {
        bucket: BucketConfig {
            check_full_buckets_interval: Duration::from_millis(10),
            store_buckets_interval: Duration::from_millis(10),
            max_bucket_records,
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

/// A record whose payload is its own timestamp
pub fn record(stream: &StreamPartition, ts: Timestamp, seq: u32) -> Record {
    Record::new(stream, ts, seq, "publisher", "chain", ts.to_string().into_bytes())
}

pub fn timestamps(payloads: &[bytes::Bytes]) -> Vec<Timestamp> {
    payloads
        .iter()
        .map(|p| {
            std::str::from_utf8(p)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(-1)
        })
        .collect()
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Memory store with switchable failures
pub struct FailingStore {
    pub inner: MemoryColumnStore,
    pub fail_inserts: AtomicBool,
    pub fail_queries: AtomicBool,
    pub insert_attempts: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryColumnStore::new(),
            fail_inserts: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            insert_attempts: AtomicUsize::new(0),
        })
    }

    fn check_query(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Query("injected query failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ColumnStore for FailingStore {
    async fn query_buckets(
        &self,
        stream: &StreamPartition,
        query: BucketQuery,
    ) -> Result<Vec<BucketRow>> {
        self.check_query()?;
        self.inner.query_buckets(stream, query).await
    }

    async fn bucket_ids_page(
        &self,
        stream: &StreamPartition,
        page: Option<PageState>,
        fetch_size: usize,
    ) -> Result<BucketIdPage> {
        self.check_query()?;
        self.inner.bucket_ids_page(stream, page, fetch_size).await
    }

    async fn upsert_bucket(&self, row: BucketRow) -> Result<()> {
        self.inner.upsert_bucket(row).await
    }

    async fn count_rows(&self, stream: &StreamPartition, bucket_id: BucketId) -> Result<u64> {
        self.check_query()?;
        self.inner.count_rows(stream, bucket_id).await
    }

    async fn last_rows(
        &self,
        stream: &StreamPartition,
        bucket_ids: &[BucketId],
        limit: usize,
    ) -> Result<Vec<DataRow>> {
        self.check_query()?;
        self.inner.last_rows(stream, bucket_ids, limit).await
    }

    fn stream_rows(&self, query: DataQuery) -> RowStream {
        self.inner.stream_rows(query)
    }

    async fn boundary_timestamp(
        &self,
        stream: &StreamPartition,
        bucket_id: BucketId,
        ascending: bool,
    ) -> Result<Option<Timestamp>> {
        self.check_query()?;
        self.inner.boundary_timestamp(stream, bucket_id, ascending).await
    }

    async fn insert_rows(&self, rows: Vec<DataRow>, ttl: Option<Duration>) -> Result<()> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Insert("injected insert failure".into()));
        }
        self.inner.insert_rows(rows, ttl).await
    }
}
