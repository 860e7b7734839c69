//! Storage façade - the write path and the three read paths

mod engine;
mod requests;

pub use engine::{Storage, StorageStats};

use crate::batch::BatchConfig;
use crate::bucket::BucketConfig;
use crate::{Result, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bucket configuration
    pub bucket: BucketConfig,
    /// Batch configuration
    pub batch: BatchConfig,
    /// Delay before a store retries bucket resolution
    pub retries_interval: Duration,
    /// Ceiling on the messages served by a last-N request
    pub max_resend_last: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: BucketConfig::default(),
            batch: BatchConfig::default(),
            retries_interval: crate::config::STORE_RETRY_INTERVAL,
            max_resend_last: crate::config::MAX_RESEND_LAST,
        }
    }
}

impl StorageConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.bucket.validate()?;
        self.batch.validate()?;
        if self.retries_interval.is_zero() {
            return Err(StoreError::Validation(
                "store retries interval must be greater than zero".into(),
            ));
        }
        if self.max_resend_last == 0 {
            return Err(StoreError::Validation(
                "max resend last must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Read and write counters
#[derive(Debug, Default)]
pub struct StorageMetrics {
    messages_read: AtomicU64,
    bytes_read: AtomicU64,
    messages_written: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of [`StorageMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_read: u64,
    pub bytes_read: u64,
    pub messages_written: u64,
    pub bytes_written: u64,
}

impl StorageMetrics {
    /// Count one message served to a reader
    pub fn record_read(&self, payload_bytes: u64) {
        self.messages_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Count one message persisted
    pub fn record_write(&self, payload_bytes: u64) {
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_read: self.messages_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
