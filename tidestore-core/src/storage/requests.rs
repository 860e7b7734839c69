//! Read paths: last N, from a position, and between two positions

use super::Storage;
use crate::bucket::Bucket;
use crate::query::{MessageStream, Position, QueryPlanner, RangeRequest};
use crate::{BucketId, Result, StreamPartition};
use std::sync::Arc;

/// Buckets walked per page when counting towards a last-N request
const LAST_BUCKETS_FETCH_SIZE: usize = 1;

impl Storage {
    /// The newest `limit` messages in ascending order, capped at
    /// `max_resend_last`
    ///
    /// Buckets are walked newest first, summing their stored rows until
    /// enough are covered; the rows are then read newest first in one
    /// query and reversed.
    pub fn request_last(&self, stream: &StreamPartition, limit: usize) -> MessageStream {
        let limit = limit.min(self.config.max_resend_last);
        if limit == 0 {
            return MessageStream::empty(Arc::clone(&self.metrics));
        }

        let store = Arc::clone(&self.store);
        let key = stream.clone();
        let debug_info = format!("last {} of {}", limit, stream);

        MessageStream::spawn(debug_info, Arc::clone(&self.metrics), |sink| async move {
            let mut bucket_ids: Vec<BucketId> = Vec::new();
            let mut total = 0u64;
            let mut page = None;

            'walk: loop {
                let result = store
                    .bucket_ids_page(&key, page.take(), LAST_BUCKETS_FETCH_SIZE)
                    .await?;
                for bucket_id in result.ids {
                    bucket_ids.push(bucket_id);
                    total += store.count_rows(&key, bucket_id).await?;
                    if total >= limit as u64 {
                        break 'walk;
                    }
                }
                match result.next {
                    Some(next) => page = Some(next),
                    None => break,
                }
            }

            if bucket_ids.is_empty() {
                return Ok(());
            }

            let mut rows = store.last_rows(&key, &bucket_ids, limit).await?;
            rows.reverse();
            for row in rows {
                if !sink.send(row).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Every message from `from` onwards, optionally of one publisher's
    /// message chain
    pub fn request_from(
        &self,
        stream: &StreamPartition,
        from: Position,
        publisher: Option<(&str, &str)>,
    ) -> Result<MessageStream> {
        let mut request = RangeRequest::new(stream.clone(), from, Position::max());
        if let Some((publisher_id, msg_chain_id)) = publisher {
            request = request.with_publisher(publisher_id, msg_chain_id);
        }
        self.request_range(request)
    }

    /// Every message between two positions, inclusive
    ///
    /// Fails before any query runs if only one of publisher id and message
    /// chain id is set. Fragments are streamed one after another: low
    /// boundary, interior, high boundary.
    pub fn request_range(&self, request: RangeRequest) -> Result<MessageStream> {
        QueryPlanner::validate(&request)?;

        let store = Arc::clone(&self.store);
        let buckets = Arc::clone(&self.buckets);
        let debug_info = format!(
            "range of {} from {:?} to {:?}",
            request.stream, request.from, request.to
        );

        Ok(MessageStream::spawn(debug_info, Arc::clone(&self.metrics), |sink| async move {
            let candidates = buckets
                .get_buckets_by_timestamp(
                    &request.stream,
                    Some(request.from.timestamp),
                    Some(request.to.timestamp),
                )
                .await?;
            let bucket_ids = candidates.iter().map(Bucket::id).collect();

            let plan = QueryPlanner::plan(&request, bucket_ids)?;
            for fragment in plan.fragments {
                if !sink.forward(store.stream_rows(fragment)).await? {
                    break;
                }
            }
            Ok(())
        }))
    }
}
