//! Column-store boundary
//!
//! The engine reads and writes two logical tables:
//!
//! - `bucket(stream_id, partition, date_create, id, records, size)`, looked
//!   up by `(stream_id, partition, date_create)`
//! - `stream_data(stream_id, partition, bucket_id, ts, sequence_no,
//!   publisher_id, msg_chain_id, payload)`, partitioned by
//!   `(stream_id, partition, bucket_id)` and clustered by
//!   `(ts, sequence_no)`
//!
//! [`ColumnStore`] is the only way the engine touches them. The
//! [`MemoryColumnStore`] implements it in-process, optionally journaled to
//! disk.

mod memory;

pub use memory::MemoryColumnStore;

use crate::{BucketId, Record, Result, SequenceNo, StreamPartition, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A persisted bucket counter row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRow {
    pub stream_id: String,
    pub partition: u32,
    pub date_create: Timestamp,
    pub id: BucketId,
    pub records: u64,
    pub size: u64,
}

/// A persisted message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub stream_id: String,
    pub partition: u32,
    pub bucket_id: BucketId,
    pub timestamp: Timestamp,
    pub sequence_no: SequenceNo,
    pub publisher_id: String,
    pub msg_chain_id: String,
    /// `None` only for corrupt rows
    pub payload: Option<Bytes>,
}

impl DataRow {
    /// The row a record is written as inside `bucket_id`
    pub fn from_record(bucket_id: BucketId, record: &Record) -> Self {
        Self {
            stream_id: record.stream_id.clone(),
            partition: record.partition,
            bucket_id,
            timestamp: record.timestamp,
            sequence_no: record.sequence_no,
            publisher_id: record.publisher_id.clone(),
            msg_chain_id: record.msg_chain_id.clone(),
            payload: Some(record.payload.clone()),
        }
    }
}

/// Lookups on the bucket table, always scoped to one stream-partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketQuery {
    /// Newest `limit` buckets, optionally only those with
    /// `date_create <= at_or_before`
    Latest {
        limit: usize,
        at_or_before: Option<Timestamp>,
    },
    /// Buckets with `after < date_create <= until`, newest first
    Range {
        after: Option<Timestamp>,
        until: Option<Timestamp>,
    },
    /// The single oldest bucket
    Oldest,
}

impl BucketQuery {
    /// Whether a bucket created at `date_create` passes the bounds
    pub fn admits(&self, date_create: Timestamp) -> bool {
        match *self {
            BucketQuery::Latest { at_or_before, .. } => {
                at_or_before.map_or(true, |ts| date_create <= ts)
            }
            BucketQuery::Range { after, until } => {
                after.map_or(true, |ts| date_create > ts)
                    && until.map_or(true, |ts| date_create <= ts)
            }
            BucketQuery::Oldest => true,
        }
    }
}

/// Opaque continuation for paged bucket iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState(pub Bytes);

/// One page of bucket ids, newest first
#[derive(Debug, Clone, Default)]
pub struct BucketIdPage {
    pub ids: Vec<BucketId>,
    pub next: Option<PageState>,
}

/// Timestamp and sequence bounds of one data query fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFilter {
    /// `from <= ts <= to`
    Between { from: Timestamp, to: Timestamp },
    /// `after < ts < before`
    Exclusive { after: Timestamp, before: Timestamp },
    /// `ts = timestamp AND sequence_no >= min_sequence`
    StartingAt {
        timestamp: Timestamp,
        min_sequence: SequenceNo,
    },
    /// `ts = timestamp AND sequence_no <= max_sequence`
    EndingAt {
        timestamp: Timestamp,
        max_sequence: SequenceNo,
    },
    /// `ts = timestamp AND min_sequence <= sequence_no <= max_sequence`
    Exactly {
        timestamp: Timestamp,
        min_sequence: SequenceNo,
        max_sequence: SequenceNo,
    },
}

impl TimestampFilter {
    pub fn matches(&self, ts: Timestamp, seq: SequenceNo) -> bool {
        match *self {
            TimestampFilter::Between { from, to } => ts >= from && ts <= to,
            TimestampFilter::Exclusive { after, before } => ts > after && ts < before,
            TimestampFilter::StartingAt { timestamp, min_sequence } => {
                ts == timestamp && seq >= min_sequence
            }
            TimestampFilter::EndingAt { timestamp, max_sequence } => {
                ts == timestamp && seq <= max_sequence
            }
            TimestampFilter::Exactly {
                timestamp,
                min_sequence,
                max_sequence,
            } => ts == timestamp && seq >= min_sequence && seq <= max_sequence,
        }
    }
}

/// One streaming read over `stream_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataQuery {
    pub stream: StreamPartition,
    pub bucket_ids: Vec<BucketId>,
    pub filter: TimestampFilter,
    pub publisher_id: Option<String>,
    pub msg_chain_id: Option<String>,
}

impl DataQuery {
    /// Whether a row of one of the queried buckets passes every predicate
    pub fn matches(&self, row: &DataRow) -> bool {
        self.filter.matches(row.timestamp, row.sequence_no)
            && self
                .publisher_id
                .as_deref()
                .map_or(true, |p| p == row.publisher_id)
            && self
                .msg_chain_id
                .as_deref()
                .map_or(true, |c| c == row.msg_chain_id)
    }
}

/// Pull-based stream of rows from one query
pub type RowStream = BoxStream<'static, Result<DataRow>>;

/// Operations the engine needs from the underlying column store
///
/// Implementations share one connection/session across all callers.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Run a prepared lookup over the bucket table
    async fn query_buckets(
        &self,
        stream: &StreamPartition,
        query: BucketQuery,
    ) -> Result<Vec<BucketRow>>;

    /// Iterate bucket ids newest first, `fetch_size` per page
    async fn bucket_ids_page(
        &self,
        stream: &StreamPartition,
        page: Option<PageState>,
        fetch_size: usize,
    ) -> Result<BucketIdPage>;

    /// Insert or overwrite a bucket counter row
    async fn upsert_bucket(&self, row: BucketRow) -> Result<()>;

    /// Number of message rows stored in one bucket
    async fn count_rows(&self, stream: &StreamPartition, bucket_id: BucketId) -> Result<u64>;

    /// The newest `limit` rows across `bucket_ids`, descending by
    /// `(ts, sequence_no)`
    async fn last_rows(
        &self,
        stream: &StreamPartition,
        bucket_ids: &[BucketId],
        limit: usize,
    ) -> Result<Vec<DataRow>>;

    /// Stream the rows matching `query`, ascending by `(ts, sequence_no)`
    fn stream_rows(&self, query: DataQuery) -> RowStream;

    /// Smallest (`ascending`) or largest timestamp stored in one bucket
    async fn boundary_timestamp(
        &self,
        stream: &StreamPartition,
        bucket_id: BucketId,
        ascending: bool,
    ) -> Result<Option<Timestamp>>;

    /// Atomically write all rows, optionally expiring them after `ttl`
    async fn insert_rows(&self, rows: Vec<DataRow>, ttl: Option<Duration>) -> Result<()>;
}
