//! Query planner - splits range requests into column-store fragments

use super::RangeRequest;
use crate::column::{DataQuery, TimestampFilter};
use crate::{BucketId, Result, StoreError};

/// Fragments of one range request, read in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub fragments: Vec<DataQuery>,
}

impl QueryPlan {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Query planner
pub struct QueryPlanner;

impl QueryPlanner {
    /// Reject filter combinations the read path does not support
    pub fn validate(request: &RangeRequest) -> Result<()> {
        match (&request.publisher_id, &request.msg_chain_id) {
            (Some(_), None) | (None, Some(_)) => Err(StoreError::Validation(format!(
                "publisher id ({:?}) and message chain id ({:?}) must be given together",
                request.publisher_id, request.msg_chain_id
            ))),
            _ => Ok(()),
        }
    }

    /// Plan a range request over the candidate buckets
    ///
    /// Without sequence filtering a single fragment covers the range.
    /// Otherwise the boundary timestamps are bounded by sequence number and
    /// the interior is read as an open range, low boundary first.
    pub fn plan(request: &RangeRequest, bucket_ids: Vec<BucketId>) -> Result<QueryPlan> {
        Self::validate(request)?;

        if bucket_ids.is_empty() {
            return Ok(QueryPlan {
                fragments: Vec::new(),
            });
        }

        let (from, to) = (request.from, request.to);
        let filters = if request.spans_whole_timestamps() {
            vec![TimestampFilter::Between {
                from: from.timestamp,
                to: to.timestamp,
            }]
        } else if from.timestamp == to.timestamp {
            vec![TimestampFilter::Exactly {
                timestamp: from.timestamp,
                min_sequence: from.sequence_no,
                max_sequence: to.sequence_no,
            }]
        } else {
            vec![
                TimestampFilter::StartingAt {
                    timestamp: from.timestamp,
                    min_sequence: from.sequence_no,
                },
                TimestampFilter::Exclusive {
                    after: from.timestamp,
                    before: to.timestamp,
                },
                TimestampFilter::EndingAt {
                    timestamp: to.timestamp,
                    max_sequence: to.sequence_no,
                },
            ]
        };

        let fragments = filters
            .into_iter()
            .map(|filter| DataQuery {
                stream: request.stream.clone(),
                bucket_ids: bucket_ids.clone(),
                filter,
                publisher_id: request.publisher_id.clone(),
                msg_chain_id: request.msg_chain_id.clone(),
            })
            .collect();

        Ok(QueryPlan { fragments })
    }
}
