//! Per stream-partition bucket index

use crate::{BucketId, Timestamp};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    date_create: Timestamp,
    id: BucketId,
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date_create
            .cmp(&other.date_create)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Known buckets of one stream-partition, most recently created first,
/// plus the earliest timestamp still waiting for a bucket
#[derive(Debug, Default)]
pub struct BucketIndex {
    entries: BinaryHeap<IndexEntry>,
    min_timestamp: Option<Timestamp>,
}

impl BucketIndex {
    /// Create an empty index with one pending timestamp
    pub fn pending(timestamp: Timestamp) -> Self {
        Self {
            entries: BinaryHeap::new(),
            min_timestamp: Some(timestamp),
        }
    }

    /// Track a bucket
    pub fn push(&mut self, id: BucketId, date_create: Timestamp) {
        self.entries.push(IndexEntry { date_create, id });
    }

    /// The most recently created bucket
    pub fn latest(&self) -> Option<BucketId> {
        self.entries.peek().map(|e| e.id)
    }

    /// All buckets ordered by creation time, newest first
    pub fn newest_first(&self) -> Vec<(BucketId, Timestamp)> {
        self.entries
            .clone()
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| (e.id, e.date_create))
            .collect()
    }

    /// Stop tracking a bucket; the heap is rebuilt without it
    pub fn remove(&mut self, id: BucketId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: BucketId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest timestamp not yet resolved to a bucket
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.min_timestamp
    }

    /// Record an unresolved timestamp, keeping the minimum
    pub fn note_pending(&mut self, timestamp: Timestamp) {
        self.min_timestamp = Some(match self.min_timestamp {
            Some(current) => current.min(timestamp),
            None => timestamp,
        });
    }

    /// Mark every pending timestamp as resolved
    pub fn clear_pending(&mut self) {
        self.min_timestamp = None;
    }
}
