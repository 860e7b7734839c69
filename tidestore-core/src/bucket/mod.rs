//! Time-partitioned storage units
//!
//! A bucket bounds how many rows and bytes accumulate under one
//! `(stream, partition, date_create)` key before a new bucket is started.
//! Buckets are created in memory first and persisted write-behind by the
//! [`BucketManager`].

mod index;
mod manager;

pub use index::BucketIndex;
pub use manager::{BucketManager, BucketManagerStats};

use crate::column::BucketRow;
use crate::{BucketId, Result, StoreError, StreamPartition, Timestamp};
use std::time::{Duration, Instant};

/// Bucket configuration
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Delay between bucket allocation passes
    pub check_full_buckets_interval: Duration,
    /// Delay between counter persistence passes
    pub store_buckets_interval: Duration,
    /// Maximum payload bytes per bucket
    pub max_bucket_size: u64,
    /// Maximum records per bucket
    pub max_bucket_records: u64,
    /// In-memory retention after the last write
    pub bucket_keep_alive: Duration,
    /// Fraction of the maxima at which a bucket counts as almost full
    pub almost_full_ratio: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            check_full_buckets_interval: crate::config::CHECK_FULL_BUCKETS_INTERVAL,
            store_buckets_interval: crate::config::STORE_BUCKETS_INTERVAL,
            max_bucket_size: crate::config::MAX_BUCKET_SIZE,
            max_bucket_records: crate::config::MAX_BUCKET_RECORDS,
            bucket_keep_alive: crate::config::BUCKET_KEEP_ALIVE,
            almost_full_ratio: crate::config::ALMOST_FULL_RATIO,
        }
    }
}

impl BucketConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.check_full_buckets_interval.is_zero() || self.store_buckets_interval.is_zero() {
            return Err(StoreError::Validation(
                "bucket pass intervals must be greater than zero".into(),
            ));
        }
        Self::validate_limits(
            self.max_bucket_size,
            self.max_bucket_records,
            self.bucket_keep_alive,
            self.almost_full_ratio,
        )
    }

    fn validate_limits(
        max_size: u64,
        max_records: u64,
        keep_alive: Duration,
        almost_full_ratio: f64,
    ) -> Result<()> {
        if max_size == 0 {
            return Err(StoreError::Validation("max bucket size must be greater than zero".into()));
        }
        if max_records == 0 {
            return Err(StoreError::Validation(
                "max bucket records must be greater than zero".into(),
            ));
        }
        if keep_alive.is_zero() {
            return Err(StoreError::Validation(
                "bucket keep-alive must be greater than zero".into(),
            ));
        }
        if !(almost_full_ratio > 0.0 && almost_full_ratio <= 1.0) {
            return Err(StoreError::Validation(format!(
                "almost-full ratio must be in (0, 1], got {}",
                almost_full_ratio
            )));
        }
        Ok(())
    }
}

/// One time-partitioned storage unit of a stream-partition
///
/// Only mutated by its owning [`BucketManager`], which serializes all
/// access; the bucket itself carries no synchronization.
#[derive(Debug, Clone)]
pub struct Bucket {
    id: BucketId,
    stream_id: String,
    partition: u32,
    size: u64,
    records: u64,
    date_create: Timestamp,
    ttl: Instant,
    stored: bool,
    max_size: u64,
    max_records: u64,
    keep_alive: Duration,
    almost_full_ratio: f64,
}

impl Bucket {
    /// Create a bucket, validating all limits
    pub fn new(
        id: BucketId,
        stream: &StreamPartition,
        size: u64,
        records: u64,
        date_create: Timestamp,
        config: &BucketConfig,
    ) -> Result<Self> {
        if stream.stream_id.is_empty() {
            return Err(StoreError::Validation("bucket stream id must not be empty".into()));
        }
        BucketConfig::validate_limits(
            config.max_bucket_size,
            config.max_bucket_records,
            config.bucket_keep_alive,
            config.almost_full_ratio,
        )?;

        Ok(Self {
            id,
            stream_id: stream.stream_id.clone(),
            partition: stream.partition,
            size,
            records,
            date_create,
            ttl: Instant::now() + config.bucket_keep_alive,
            stored: false,
            max_size: config.max_bucket_size,
            max_records: config.max_bucket_records,
            keep_alive: config.bucket_keep_alive,
            almost_full_ratio: config.almost_full_ratio,
        })
    }

    /// Rebuild a bucket from its persisted row
    pub fn from_row(row: &BucketRow, config: &BucketConfig) -> Result<Self> {
        let stream = StreamPartition::new(row.stream_id.clone(), row.partition);
        let mut bucket = Self::new(
            row.id,
            &stream,
            row.size,
            row.records,
            row.date_create,
            config,
        )?;
        bucket.stored = true;
        Ok(bucket)
    }

    /// The persisted form of this bucket's counters
    pub fn to_row(&self) -> BucketRow {
        BucketRow {
            stream_id: self.stream_id.clone(),
            partition: self.partition,
            date_create: self.date_create,
            id: self.id,
            records: self.records,
            size: self.size,
        }
    }

    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.clone(), self.partition)
    }

    /// Accumulated payload bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Accumulated record count
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn date_create(&self) -> Timestamp {
        self.date_create
    }

    /// Whether the persisted counters match the in-memory ones
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn set_stored(&mut self) {
        self.stored = true;
    }

    /// Whether the keep-alive window since the last write is still open
    pub fn is_alive(&self) -> bool {
        self.ttl >= Instant::now()
    }

    /// Account one more record of `size` bytes
    pub fn increment_bucket(&mut self, size: u64) {
        self.size += size;
        self.records += 1;
        self.stored = false;
        self.ttl = Instant::now() + self.keep_alive;
    }

    /// Size or record count reached the almost-full fraction of the maxima
    pub fn is_almost_full(&self) -> bool {
        self.reached(self.almost_full_ratio)
    }

    /// Size or record count reached the maxima
    pub fn is_full(&self) -> bool {
        self.reached(1.0)
    }

    fn reached(&self, ratio: f64) -> bool {
        self.size as f64 >= self.max_size as f64 * ratio
            || self.records as f64 >= self.max_records as f64 * ratio
    }
}
