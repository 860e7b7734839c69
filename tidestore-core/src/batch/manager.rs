//! Batch manager - routes records to batches and drives their inserts

use super::{Batch, BatchConfig, BatchEvent, BatchId, BatchState, DoneCallback};
use crate::column::{ColumnStore, DataRow};
use crate::{BucketId, Record, Result, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Default)]
struct BatchTables {
    /// At most one open batch per bucket
    open: HashMap<BucketId, Batch>,
    /// Locked batches awaiting or retrying their insert
    pending: HashMap<BatchId, Batch>,
}

struct ManagerInner {
    store: Arc<dyn ColumnStore>,
    config: Arc<BatchConfig>,
    tables: Mutex<BatchTables>,
    events: UnboundedSender<BatchEvent>,
}

/// Batch manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchManagerStats {
    pub open_batches: usize,
    pub pending_batches: usize,
}

/// Owner of every batch
pub struct BatchManager {
    inner: Arc<ManagerInner>,
    cancel: CancellationToken,
}

impl BatchManager {
    /// Create a manager and start its event dispatcher
    pub fn new(store: Arc<dyn ColumnStore>, config: BatchConfig) -> Result<Self> {
        config.validate()?;

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            store,
            config: Arc::new(config),
            tables: Mutex::new(BatchTables::default()),
            events,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(Self::dispatch(Arc::clone(&inner), rx, cancel.clone()));
        Ok(Self { inner, cancel })
    }

    async fn dispatch(
        inner: Arc<ManagerInner>,
        mut rx: UnboundedReceiver<BatchEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                BatchEvent::Locked {
                    batch_id, bucket_id, ..
                } => inner.move_to_pending(bucket_id, batch_id),
                BatchEvent::Pending { batch_id } => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move { inner.insert(batch_id).await });
                }
            }
        }
    }

    /// Buffer a record in the open batch of its bucket
    ///
    /// A full or already locked batch is handed over for insertion first
    /// and a fresh batch opened in its place. Fails with
    /// [`StoreError::Closed`] once the manager is stopped.
    pub fn store(&self, bucket_id: BucketId, record: Record, done: DoneCallback) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        // Checked under the table lock so `stop` cannot interleave
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }

        let exhausted = tables
            .open
            .get(&bucket_id)
            .map(|batch| batch.is_full() || batch.state() != BatchState::Opened);
        if exhausted == Some(true) {
            if let Some(batch) = tables.open.remove(&bucket_id) {
                batch.lock();
                batch.schedule_insert();
                tables.pending.insert(batch.id(), batch);
            }
        }

        let batch = match tables.open.get(&bucket_id) {
            Some(batch) => batch.clone(),
            None => {
                let batch = Batch::new(
                    bucket_id,
                    Arc::clone(&self.inner.config),
                    self.inner.events.clone(),
                )?;
                tables.open.insert(bucket_id, batch.clone());
                batch
            }
        };
        batch.push(record, done);
        Ok(())
    }

    /// Attempt the bulk insert of a pending batch
    pub async fn insert(&self, batch_id: BatchId) {
        self.inner.insert(batch_id).await
    }

    /// Handle to the open batch of a bucket
    pub fn open_batch(&self, bucket_id: BucketId) -> Option<Batch> {
        self.inner.tables.lock().open.get(&bucket_id).cloned()
    }

    /// Whether a batch is still waiting for a successful insert
    pub fn is_pending(&self, batch_id: BatchId) -> bool {
        self.inner.tables.lock().pending.contains_key(&batch_id)
    }

    /// Discard every batch without waiting for running inserts
    pub fn stop(&self) {
        let mut tables = self.inner.tables.lock();
        self.cancel.cancel();
        debug!(
            "Stopping batch manager, discarding {} open and {} pending batches",
            tables.open.len(),
            tables.pending.len()
        );
        for (_, batch) in tables.open.drain() {
            batch.clear();
        }
        for (_, batch) in tables.pending.drain() {
            batch.clear();
        }
    }

    /// Get manager statistics
    pub fn stats(&self) -> BatchManagerStats {
        let tables = self.inner.tables.lock();
        BatchManagerStats {
            open_batches: tables.open.len(),
            pending_batches: tables.pending.len(),
        }
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ManagerInner {
    /// Move a batch locked by its close timer out of the open table
    fn move_to_pending(&self, bucket_id: BucketId, batch_id: BatchId) {
        let mut tables = self.tables.lock();
        let is_open = tables
            .open
            .get(&bucket_id)
            .is_some_and(|batch| batch.id() == batch_id);
        if !is_open {
            // Already handed over by `store`
            return;
        }
        if let Some(batch) = tables.open.remove(&bucket_id) {
            batch.schedule_insert();
            tables.pending.insert(batch_id, batch);
        }
    }

    async fn insert(&self, batch_id: BatchId) {
        let Some(batch) = self.tables.lock().pending.get(&batch_id).cloned() else {
            return;
        };

        let bucket_id = batch.bucket_id();
        let rows: Vec<DataRow> = batch
            .records()
            .iter()
            .map(|record| DataRow::from_record(bucket_id, record))
            .collect();
        let count = rows.len();

        match self.store.insert_rows(rows, self.config.insert_ttl).await {
            Ok(()) => {
                debug!("Inserted batch {} ({} records)", batch_id, count);
                self.tables.lock().pending.remove(&batch_id);
                batch.done();
                batch.clear();
            }
            Err(e) if batch.reached_max_retries() => {
                error!(
                    "Dropping batch {} of bucket {} ({} records) after {} failed inserts: {}",
                    batch_id,
                    bucket_id,
                    count,
                    batch.retries(),
                    e
                );
                self.tables.lock().pending.remove(&batch_id);
                batch.clear();
            }
            Err(e) => {
                warn!(
                    "Insert of batch {} failed (attempt {}): {}",
                    batch_id,
                    batch.retries(),
                    e
                );
                batch.schedule_insert();
            }
        }
    }
}
