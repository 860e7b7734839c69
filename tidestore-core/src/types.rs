//! Core types for Tidestore

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Message sequence number within one timestamp of a message chain
pub type SequenceNo = u32;

/// Largest timestamp a message may carry
pub const MAX_TIMESTAMP: Timestamp = 8_640_000_000_000_000;

/// Smallest sequence number; a range starting here filters nothing
pub const MIN_SEQUENCE_NUMBER: SequenceNo = 0;

/// Largest sequence number; a range ending here filters nothing
pub const MAX_SEQUENCE_NUMBER: SequenceNo = 2_147_483_647;

/// Key of one ordered message stream: a stream id and one of its partitions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPartition {
    /// Stream identifier
    pub stream_id: String,
    /// Partition number
    pub partition: u32,
}

impl StreamPartition {
    /// Create a new stream-partition key
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream_id, self.partition)
    }
}

/// Opaque bucket identifier
///
/// Backed by a time-ordered UUID generated from the bucket's creation
/// timestamp, so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(Uuid);

impl BucketId {
    /// Generate a new id for a bucket created at `date_create`
    pub fn generate(date_create: Timestamp) -> Self {
        let millis = date_create.max(0) as u64;
        let ts = uuid::Timestamp::from_unix(
            uuid::NoContext,
            millis / 1000,
            ((millis % 1000) * 1_000_000) as u32,
        );
        Self(Uuid::new_v7(ts))
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message to be stored
///
/// Identity for ordering is `(timestamp, sequence_no)` within its
/// stream-partition. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub stream_id: String,
    pub partition: u32,
    pub timestamp: Timestamp,
    pub sequence_no: SequenceNo,
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub payload: Bytes,
}

impl Record {
    /// Create a new record
    pub fn new(
        stream: &StreamPartition,
        timestamp: Timestamp,
        sequence_no: SequenceNo,
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            stream_id: stream.stream_id.clone(),
            partition: stream.partition,
            timestamp,
            sequence_no,
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
            payload: payload.into(),
        }
    }

    /// The stream-partition this record belongs to
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream_id.clone(), self.partition)
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}
