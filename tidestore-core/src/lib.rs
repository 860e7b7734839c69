//! Tidestore Core - Bucketed Message Storage Engine
//!
//! Persists an append-only stream of timestamped messages into a
//! column store and serves them back as ordered, back-pressured streams.
//!
//! # Architecture
//!
//! - **Buckets**: time-partitioned storage units that keep each physical
//!   partition of a `(stream, partition)` bounded in size
//! - **Batches**: write buffers bound to one bucket, flushed as a single
//!   atomic bulk insert with bounded retries
//! - **Query planner**: resolves which buckets and time ranges to read and
//!   splits a range request into column-store fragments
//! - **Storage**: the façade tying the write path and the three read paths
//!   (last N, from timestamp, timestamp range) together
//! - **Column store**: the boundary to the underlying store, with an
//!   embedded journaled implementation

pub mod batch;
pub mod bucket;
pub mod column;
pub mod journal;
pub mod query;
pub mod storage;

mod error;
mod types;

pub use error::{StoreError, Result};
pub use types::*;

/// Tidestore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Interval between passes that allocate buckets for pending timestamps
    pub const CHECK_FULL_BUCKETS_INTERVAL: Duration = Duration::from_millis(1000);

    /// Interval between passes that persist bucket counters
    pub const STORE_BUCKETS_INTERVAL: Duration = Duration::from_millis(500);

    /// Maximum bucket size (100MB)
    pub const MAX_BUCKET_SIZE: u64 = 100 * 1024 * 1024;

    /// Maximum records per bucket
    pub const MAX_BUCKET_RECORDS: u64 = 500 * 1000;

    /// How long a persisted bucket stays in memory after its last write
    pub const BUCKET_KEEP_ALIVE: Duration = Duration::from_secs(60);

    /// Fraction of the bucket maxima at which a new bucket is allocated
    pub const ALMOST_FULL_RATIO: f64 = 0.7;

    /// Maximum batch size (10MB)
    pub const BATCH_MAX_SIZE: u64 = 10 * 1024 * 1024;

    /// Maximum records per batch
    pub const BATCH_MAX_RECORDS: usize = 10_000;

    /// Time an open batch accepts records before it is locked
    pub const BATCH_CLOSE_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Insert attempts before a batch is dropped
    pub const BATCH_MAX_RETRIES: u32 = 64;

    /// Row time-to-live applied when insert TTL is enabled (3 days)
    pub const INSERT_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

    /// Delay before retrying a store whose bucket is not yet known
    pub const STORE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

    /// Hard ceiling on the number of messages served by a last-N request
    pub const MAX_RESEND_LAST: usize = 10_000;

    /// Buffered messages between a query producer and its consumer
    pub const RESULT_STREAM_CAPACITY: usize = 1024;

    /// Rows fetched per page by streaming queries
    pub const STREAM_FETCH_SIZE: usize = 128;

    /// Continuous row processing allowed before a result stream yields
    pub const YIELD_INTERVAL: Duration = Duration::from_millis(100);

    /// Journal segment size (16MB)
    pub const JOURNAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
