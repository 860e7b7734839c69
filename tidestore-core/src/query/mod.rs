//! Read-path planning and result streaming
//!
//! A range request is planned into one or more column-store fragments
//! over the candidate buckets. Rows of every fragment are funneled into a
//! single [`MessageStream`] that skips corrupt rows and yields control
//! periodically while busy.

mod planner;
mod stream;

pub use planner::{QueryPlan, QueryPlanner};
pub use stream::MessageStream;

use crate::{
    SequenceNo, StreamPartition, Timestamp, MAX_SEQUENCE_NUMBER, MAX_TIMESTAMP,
    MIN_SEQUENCE_NUMBER,
};

/// A point in a stream-partition's message order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub timestamp: Timestamp,
    pub sequence_no: SequenceNo,
}

impl Position {
    pub fn new(timestamp: Timestamp, sequence_no: SequenceNo) -> Self {
        Self {
            timestamp,
            sequence_no,
        }
    }

    /// First position at `timestamp`
    pub fn start_of(timestamp: Timestamp) -> Self {
        Self::new(timestamp, MIN_SEQUENCE_NUMBER)
    }

    /// Last position at `timestamp`
    pub fn end_of(timestamp: Timestamp) -> Self {
        Self::new(timestamp, MAX_SEQUENCE_NUMBER)
    }

    /// The last representable position
    pub fn max() -> Self {
        Self::end_of(MAX_TIMESTAMP)
    }
}

/// Messages of one stream-partition between two positions, inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub stream: StreamPartition,
    pub from: Position,
    pub to: Position,
    /// Set together with `msg_chain_id` or not at all
    pub publisher_id: Option<String>,
    pub msg_chain_id: Option<String>,
}

impl RangeRequest {
    pub fn new(stream: StreamPartition, from: Position, to: Position) -> Self {
        Self {
            stream,
            from,
            to,
            publisher_id: None,
            msg_chain_id: None,
        }
    }

    /// Only messages of one publisher's message chain
    pub fn with_publisher(
        mut self,
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
    ) -> Self {
        self.publisher_id = Some(publisher_id.into());
        self.msg_chain_id = Some(msg_chain_id.into());
        self
    }

    /// Whether the sequence bounds filter nothing at the boundary timestamps
    pub fn spans_whole_timestamps(&self) -> bool {
        self.from.sequence_no == MIN_SEQUENCE_NUMBER && self.to.sequence_no == MAX_SEQUENCE_NUMBER
    }
}
