//! In-process column store
//!
//! Keeps both tables in ordered maps. When opened with a journal, every
//! mutation is appended to it before being applied, and the tables are
//! rebuilt from it on open.

use super::{
    BucketIdPage, BucketQuery, BucketRow, ColumnStore, DataQuery, DataRow, PageState, RowStream,
};
use crate::journal::{JournalConfig, JournalEntry, JournalReader, JournalWriter};
use crate::{BucketId, Result, SequenceNo, StoreError, StreamPartition, Timestamp};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use uuid::Uuid;

/// Clustering key of a message row inside its bucket partition
type RowKey = (Timestamp, SequenceNo, String, String);

#[derive(Debug, Clone)]
struct StoredRow {
    row: DataRow,
    expires_at: Option<Timestamp>,
}

impl StoredRow {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Partition = BTreeMap<RowKey, StoredRow>;

/// Position of a streaming read: the last row returned and its bucket
type PageCursor = (RowKey, BucketId);

#[derive(Debug, Default)]
struct Tables {
    /// bucket table: (stream_id, partition) -> (date_create, id) -> row
    buckets: HashMap<StreamPartition, BTreeMap<(Timestamp, BucketId), BucketRow>>,
    /// stream_data table: (stream_id, partition, bucket_id) -> rows
    data: HashMap<(StreamPartition, BucketId), Partition>,
}

impl Tables {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::UpsertBucket(row) => {
                let key = StreamPartition::new(row.stream_id.clone(), row.partition);
                self.buckets
                    .entry(key)
                    .or_default()
                    .insert((row.date_create, row.id), row);
            }
            JournalEntry::InsertRows { rows, expires_at } => {
                for row in rows {
                    let partition = (
                        StreamPartition::new(row.stream_id.clone(), row.partition),
                        row.bucket_id,
                    );
                    let key = row_key(&row);
                    self.data
                        .entry(partition)
                        .or_default()
                        .insert(key, StoredRow { row, expires_at });
                }
            }
        }
    }

    fn partition(&self, stream: &StreamPartition, bucket_id: BucketId) -> Option<&Partition> {
        self.data.get(&(stream.clone(), bucket_id))
    }
}

fn row_key(row: &DataRow) -> RowKey {
    (
        row.timestamp,
        row.sequence_no,
        row.publisher_id.clone(),
        row.msg_chain_id.clone(),
    )
}

/// Paging state: the clustering key of the last bucket returned
fn encode_page_state(row: &BucketRow) -> PageState {
    let mut state = BytesMut::with_capacity(24);
    state.put_i64(row.date_create);
    state.put_slice(row.id.as_uuid().as_bytes());
    PageState(state.freeze())
}

fn decode_page_state(state: &PageState) -> Result<(Timestamp, BucketId)> {
    let raw = state.0.as_ref();
    if raw.len() != 24 {
        return Err(StoreError::Query(format!(
            "invalid paging state ({} bytes)",
            raw.len()
        )));
    }
    let mut date_create = [0u8; 8];
    date_create.copy_from_slice(&raw[..8]);
    let id = Uuid::from_slice(&raw[8..]).map_err(|e| StoreError::Query(e.to_string()))?;
    Ok((Timestamp::from_be_bytes(date_create), BucketId::from_uuid(id)))
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Column store held in memory, optionally backed by a journal
pub struct MemoryColumnStore {
    tables: Arc<RwLock<Tables>>,
    journal: Option<JournalWriter>,
    fetch_size: usize,
}

impl Default for MemoryColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryColumnStore {
    /// A volatile store
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            journal: None,
            fetch_size: crate::config::STREAM_FETCH_SIZE,
        }
    }

    /// A durable store, replaying any existing journal in `config.dir`
    pub fn open(config: JournalConfig) -> Result<Self> {
        let entries = JournalReader::new(config.clone()).replay()?;
        let mut tables = Tables::default();
        let replayed = entries.len();
        for entry in entries {
            tables.apply(entry);
        }
        if replayed > 0 {
            info!("Rebuilt column store from {} journal entries", replayed);
        }

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            journal: Some(JournalWriter::open(config)?),
            fetch_size: crate::config::STREAM_FETCH_SIZE,
        })
    }

    /// Rows fetched per page by streaming queries
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    /// Force the journal to disk
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn commit(&self, entry: JournalEntry) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        self.tables.write().apply(entry);
        Ok(())
    }

    /// Next page of rows after `cursor`, merged across the queried buckets
    ///
    /// Rows are ordered by clustering key, then bucket id, so equal keys
    /// stored in different buckets are each returned once.
    fn fetch_page(
        tables: &RwLock<Tables>,
        query: &DataQuery,
        cursor: Option<&PageCursor>,
        fetch_size: usize,
    ) -> Vec<(PageCursor, DataRow)> {
        let now = now_millis();
        let tables = tables.read();
        let mut page: Vec<(PageCursor, DataRow)> = Vec::new();

        for bucket_id in &query.bucket_ids {
            let Some(partition) = tables.partition(&query.stream, *bucket_id) else {
                continue;
            };
            let lower = match cursor {
                // The cursor key itself is still due in buckets sorting after it
                Some((key, last_bucket)) if bucket_id > last_bucket => {
                    Bound::Included(key.clone())
                }
                Some((key, _)) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            page.extend(
                partition
                    .range((lower, Bound::Unbounded))
                    .filter(|(_, stored)| stored.is_live(now) && query.matches(&stored.row))
                    .take(fetch_size)
                    .map(|(key, stored)| ((key.clone(), *bucket_id), stored.row.clone())),
            );
        }

        page.sort_by(|a, b| a.0.cmp(&b.0));
        page.truncate(fetch_size);
        page
    }
}

struct RowCursor {
    tables: Arc<RwLock<Tables>>,
    query: DataQuery,
    fetch_size: usize,
    last: Option<PageCursor>,
    buffer: VecDeque<DataRow>,
    exhausted: bool,
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn query_buckets(
        &self,
        stream: &StreamPartition,
        query: BucketQuery,
    ) -> Result<Vec<BucketRow>> {
        let tables = self.tables.read();
        let Some(rows) = tables.buckets.get(stream) else {
            return Ok(Vec::new());
        };

        let result = match query {
            BucketQuery::Latest { limit, .. } => rows
                .values()
                .rev()
                .filter(|row| query.admits(row.date_create))
                .take(limit)
                .cloned()
                .collect(),
            BucketQuery::Range { .. } => rows
                .values()
                .rev()
                .filter(|row| query.admits(row.date_create))
                .cloned()
                .collect(),
            BucketQuery::Oldest => rows.values().next().cloned().into_iter().collect(),
        };
        Ok(result)
    }

    async fn bucket_ids_page(
        &self,
        stream: &StreamPartition,
        page: Option<PageState>,
        fetch_size: usize,
    ) -> Result<BucketIdPage> {
        let upper = match page {
            Some(state) => Bound::Excluded(decode_page_state(&state)?),
            None => Bound::Unbounded,
        };

        let tables = self.tables.read();
        let Some(rows) = tables.buckets.get(stream) else {
            return Ok(BucketIdPage::default());
        };

        let mut iter = rows.range((Bound::Unbounded, upper)).rev();
        let taken: Vec<&BucketRow> = iter
            .by_ref()
            .take(fetch_size.max(1))
            .map(|(_, r)| r)
            .collect();
        let next = match (taken.last(), iter.next()) {
            (Some(last), Some(_)) => Some(encode_page_state(last)),
            _ => None,
        };

        Ok(BucketIdPage {
            ids: taken.into_iter().map(|r| r.id).collect(),
            next,
        })
    }

    async fn upsert_bucket(&self, row: BucketRow) -> Result<()> {
        self.commit(JournalEntry::UpsertBucket(row))
    }

    async fn count_rows(&self, stream: &StreamPartition, bucket_id: BucketId) -> Result<u64> {
        let now = now_millis();
        let tables = self.tables.read();
        Ok(tables
            .partition(stream, bucket_id)
            .map(|p| p.values().filter(|s| s.is_live(now)).count() as u64)
            .unwrap_or(0))
    }

    async fn last_rows(
        &self,
        stream: &StreamPartition,
        bucket_ids: &[BucketId],
        limit: usize,
    ) -> Result<Vec<DataRow>> {
        let now = now_millis();
        let tables = self.tables.read();
        let mut rows: Vec<(RowKey, DataRow)> = Vec::new();

        for bucket_id in bucket_ids {
            if let Some(partition) = tables.partition(stream, *bucket_id) {
                rows.extend(
                    partition
                        .iter()
                        .rev()
                        .filter(|(_, s)| s.is_live(now))
                        .take(limit)
                        .map(|(k, s)| (k.clone(), s.row.clone())),
                );
            }
        }

        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.truncate(limit);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    fn stream_rows(&self, query: DataQuery) -> RowStream {
        let cursor = RowCursor {
            tables: Arc::clone(&self.tables),
            query,
            fetch_size: self.fetch_size,
            last: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            if cursor.buffer.is_empty() && !cursor.exhausted {
                let page = Self::fetch_page(
                    &cursor.tables,
                    &cursor.query,
                    cursor.last.as_ref(),
                    cursor.fetch_size,
                );
                cursor.exhausted = page.len() < cursor.fetch_size;
                if let Some((last, _)) = page.last() {
                    cursor.last = Some(last.clone());
                }
                cursor.buffer.extend(page.into_iter().map(|(_, row)| row));
            }
            let row = cursor.buffer.pop_front()?;
            Some((Ok(row), cursor))
        })
        .boxed()
    }

    async fn boundary_timestamp(
        &self,
        stream: &StreamPartition,
        bucket_id: BucketId,
        ascending: bool,
    ) -> Result<Option<Timestamp>> {
        let now = now_millis();
        let tables = self.tables.read();
        let Some(partition) = tables.partition(stream, bucket_id) else {
            return Ok(None);
        };

        let mut live = partition.values().filter(|s| s.is_live(now));
        let found = if ascending {
            live.next()
        } else {
            live.last()
        };
        Ok(found.map(|s| s.row.timestamp))
    }

    async fn insert_rows(&self, rows: Vec<DataRow>, ttl: Option<Duration>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let expires_at = ttl.map(|ttl| now_millis() + ttl.as_millis() as Timestamp);
        self.commit(JournalEntry::InsertRows { rows, expires_at })
    }
}
