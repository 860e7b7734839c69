//! Write batching
//!
//! A [`Batch`] buffers records bound for one bucket until it is locked,
//! either by its close timer or by its owner once full. Locked batches are
//! inserted as one bulk write by the [`BatchManager`], retried with linear
//! backoff up to a fixed number of attempts.

mod manager;

pub use manager::{BatchManager, BatchManagerStats};

use crate::{BucketId, Record, Result, StoreError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// Invoked once the record it was pushed with has been inserted
pub type DoneCallback = Box<dyn FnOnce() + Send>;

/// Batch configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Payload bytes at which a batch counts as full
    pub max_size: u64,
    /// Records at which a batch counts as full
    pub max_records: usize,
    /// Time a batch stays open; also the backoff step between retries
    pub close_timeout: Duration,
    /// Insert attempts before the batch is dropped
    pub max_retries: u32,
    /// Time-to-live applied to inserted rows
    pub insert_ttl: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: crate::config::BATCH_MAX_SIZE,
            max_records: crate::config::BATCH_MAX_RECORDS,
            close_timeout: crate::config::BATCH_CLOSE_TIMEOUT,
            max_retries: crate::config::BATCH_MAX_RETRIES,
            insert_ttl: None,
        }
    }
}

impl BatchConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(StoreError::Validation("batch max size must be greater than zero".into()));
        }
        if self.max_records == 0 {
            return Err(StoreError::Validation(
                "batch max records must be greater than zero".into(),
            ));
        }
        if self.close_timeout.is_zero() {
            return Err(StoreError::Validation(
                "batch close timeout must be greater than zero".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(StoreError::Validation(
                "batch max retries must be greater than zero".into(),
            ));
        }
        if matches!(self.insert_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(StoreError::Validation("insert ttl must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Unique batch identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Batch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting records
    Opened,
    /// Closed for records, waiting for its insert to be scheduled
    Locked,
    /// Insert attempt due or running
    Pending,
    /// Records written
    Inserted,
}

/// State changes a batch reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Locked {
        batch_id: BatchId,
        bucket_id: BucketId,
        size: u64,
        records: usize,
    },
    Pending {
        batch_id: BatchId,
    },
}

struct BatchInner {
    records: Vec<Record>,
    size: u64,
    retries: u32,
    state: BatchState,
    done_callbacks: Vec<DoneCallback>,
    timer: Option<JoinHandle<()>>,
}

/// A bounded write buffer for one bucket
///
/// Cloning yields another handle to the same batch.
#[derive(Clone)]
pub struct Batch {
    id: BatchId,
    bucket_id: BucketId,
    config: Arc<BatchConfig>,
    inner: Arc<Mutex<BatchInner>>,
    events: UnboundedSender<BatchEvent>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("bucket_id", &self.bucket_id)
            .field("state", &inner.state)
            .field("records", &inner.records.len())
            .field("size", &inner.size)
            .field("retries", &inner.retries)
            .finish()
    }
}

impl Batch {
    /// Open a batch and start its close timer
    pub fn new(
        bucket_id: BucketId,
        config: Arc<BatchConfig>,
        events: UnboundedSender<BatchEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let batch = Self {
            id: BatchId::new(),
            bucket_id,
            config,
            inner: Arc::new(Mutex::new(BatchInner {
                records: Vec::new(),
                size: 0,
                retries: 0,
                state: BatchState::Opened,
                done_callbacks: Vec::new(),
                timer: None,
            })),
            events,
        };

        let closing = batch.clone();
        let close_timeout = batch.config.close_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(close_timeout).await;
            closing.lock();
        });
        batch.inner.lock().timer = Some(timer);

        trace!("Opened batch {} for bucket {}", batch.id, bucket_id);
        Ok(batch)
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn state(&self) -> BatchState {
        self.inner.lock().state
    }

    /// Buffered payload bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Buffered record count
    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn retries(&self) -> u32 {
        self.inner.lock().retries
    }

    /// Copy of the buffered records
    pub fn records(&self) -> Vec<Record> {
        self.inner.lock().records.clone()
    }

    /// Buffer a record. The owner stops routing records here once the
    /// batch is locked.
    pub fn push(&self, record: Record, done: DoneCallback) {
        let mut inner = self.inner.lock();
        inner.size += record.size();
        inner.records.push(record);
        inner.done_callbacks.push(done);
    }

    /// Size or record count reached the configured maxima
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.size >= self.config.max_size || inner.records.len() >= self.config.max_records
    }

    /// Close the batch for new records; only the first call has an effect
    pub fn lock(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != BatchState::Opened {
            return false;
        }
        inner.state = BatchState::Locked;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        debug!(
            "Locked batch {} ({} records, {} bytes)",
            self.id,
            inner.records.len(),
            inner.size
        );
        let _ = self.events.send(BatchEvent::Locked {
            batch_id: self.id,
            bucket_id: self.bucket_id,
            size: inner.size,
            records: inner.records.len(),
        });
        true
    }

    /// Arm the insert timer; the delay grows linearly with the retries
    /// already spent
    pub fn schedule_insert(&self) {
        let mut inner = self.inner.lock();
        let delay = self.config.close_timeout * inner.retries;
        let max_retries = self.config.max_retries;
        debug!("Scheduling insert of batch {} in {:?}", self.id, delay);

        let batch = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = batch.inner.lock();
                if inner.retries < max_retries {
                    inner.retries += 1;
                }
                inner.state = BatchState::Pending;
            }
            let _ = batch.events.send(BatchEvent::Pending { batch_id: batch.id });
        });

        if let Some(previous) = inner.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Every insert attempt has been spent
    pub fn reached_max_retries(&self) -> bool {
        self.inner.lock().retries >= self.config.max_retries
    }

    /// Drop the buffered records and callbacks and cancel any timer
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.done_callbacks.clear();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    /// Mark the batch inserted and fire every callback once
    pub fn done(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.state = BatchState::Inserted;
            std::mem::take(&mut inner.done_callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamPartition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn config(max_records: usize, close_timeout: Duration) -> Arc<BatchConfig> {
        Arc::new(BatchConfig {
            max_size: 1000,
            max_records,
            close_timeout,
            max_retries: 3,
            insert_ttl: None,
        })
    }

    fn record(ts: i64) -> Record {
        Record::new(&StreamPartition::new("s1", 0), ts, 0, "p", "c", vec![0u8; 10])
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());

        let invalid = [
            BatchConfig { max_size: 0, ..Default::default() },
            BatchConfig { max_records: 0, ..Default::default() },
            BatchConfig { close_timeout: Duration::ZERO, ..Default::default() },
            BatchConfig { max_retries: 0, ..Default::default() },
            BatchConfig { insert_ttl: Some(Duration::ZERO), ..Default::default() },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(StoreError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_push_past_threshold_is_accepted() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = config(2, Duration::from_secs(60));
        let batch = Batch::new(BucketId::generate(0), config, tx).unwrap();

        batch.push(record(1), Box::new(|| {}));
        assert!(!batch.is_full());
        batch.push(record(2), Box::new(|| {}));
        assert!(batch.is_full());
        batch.push(record(3), Box::new(|| {}));
        assert_eq!(batch.record_count(), 3);
        assert_eq!(batch.size(), 30);
    }

    #[tokio::test]
    async fn test_close_timeout_locks_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = config(100, Duration::from_millis(20));
        let batch = Batch::new(BucketId::generate(0), config, tx).unwrap();
        batch.push(record(1), Box::new(|| {}));
        batch.push(record(2), Box::new(|| {}));

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BatchEvent::Locked {
                batch_id: batch.id(),
                bucket_id: batch.bucket_id(),
                size: 20,
                records: 2,
            }
        );
        assert_eq!(batch.state(), BatchState::Locked);
        assert!(!batch.lock());
    }

    #[tokio::test]
    async fn test_schedule_insert_counts_retries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = config(100, Duration::from_millis(5));
        let batch = Batch::new(BucketId::generate(0), config, tx).unwrap();
        assert!(batch.lock());
        assert!(matches!(rx.recv().await, Some(BatchEvent::Locked { .. })));

        for attempt in 1..=3 {
            batch.schedule_insert();
            let event = rx.recv().await.unwrap();
            assert_eq!(event, BatchEvent::Pending { batch_id: batch.id() });
            assert_eq!(batch.retries(), attempt);
            assert_eq!(batch.state(), BatchState::Pending);
        }
        assert!(batch.reached_max_retries());
    }

    #[tokio::test]
    async fn test_done_fires_callbacks_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = config(100, Duration::from_secs(60));
        let batch = Batch::new(BucketId::generate(0), config, tx).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        for ts in 0..3 {
            let fired = fired.clone();
            batch.push(record(ts), Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        batch.done();
        batch.done();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(batch.state(), BatchState::Inserted);
    }

    #[tokio::test]
    async fn test_clear_drops_callbacks_and_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = config(100, Duration::from_millis(10));
        let batch = Batch::new(BucketId::generate(0), config, tx).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        batch.push(record(1), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        batch.clear();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(batch.record_count(), 0);

        batch.done();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
