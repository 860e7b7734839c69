//! Result streams of the read paths

use crate::column::{DataRow, RowStream};
use crate::storage::StorageMetrics;
use crate::Result;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Producer side of a [`MessageStream`]
#[derive(Clone)]
pub(crate) struct RowSink {
    tx: mpsc::Sender<Result<DataRow>>,
}

impl RowSink {
    /// Hand one row to the consumer; `false` once the consumer is gone
    pub async fn send(&self, row: DataRow) -> bool {
        self.tx.send(Ok(row)).await.is_ok()
    }

    /// Forward every row of `rows`; `false` once the consumer is gone
    pub async fn forward(&self, mut rows: RowStream) -> Result<bool> {
        while let Some(row) = rows.next().await {
            if !self.send(row?).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Ordered, back-pressured stream of message payloads
///
/// Fed by a producer task through a bounded buffer. Rows without a
/// payload are logged and skipped. After more than
/// [`YIELD_INTERVAL`](crate::config::YIELD_INTERVAL) of uninterrupted
/// processing the stream returns `Pending` once so other tasks can run.
/// Dropping the stream stops the producer and its column-store queries.
pub struct MessageStream {
    rx: mpsc::Receiver<Result<DataRow>>,
    producer: Option<JoinHandle<()>>,
    metrics: Arc<StorageMetrics>,
    debug_info: String,
    busy_since: Instant,
}

impl MessageStream {
    /// Run `produce` as a task feeding the returned stream; an error it
    /// returns ends the stream with that error
    pub(crate) fn spawn<F, Fut>(
        debug_info: String,
        metrics: Arc<StorageMetrics>,
        produce: F,
    ) -> Self
    where
        F: FnOnce(RowSink) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(crate::config::RESULT_STREAM_CAPACITY);
        let errors = tx.clone();
        let task = produce(RowSink { tx });
        let producer = tokio::spawn(async move {
            if let Err(e) = task.await {
                let _ = errors.send(Err(e)).await;
            }
        });

        Self {
            rx,
            producer: Some(producer),
            metrics,
            debug_info,
            busy_since: Instant::now(),
        }
    }

    /// A stream that ends immediately
    pub(crate) fn empty(metrics: Arc<StorageMetrics>) -> Self {
        let (_, rx) = mpsc::channel(1);
        Self {
            rx,
            producer: None,
            metrics,
            debug_info: String::new(),
            busy_since: Instant::now(),
        }
    }

    /// Collect every payload, stopping at the first error
    pub async fn collect_payloads(mut self) -> Result<Vec<Bytes>> {
        let mut payloads = Vec::new();
        while let Some(payload) = self.next().await {
            payloads.push(payload?);
        }
        Ok(payloads)
    }
}

impl Stream for MessageStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.busy_since.elapsed() > crate::config::YIELD_INTERVAL {
                this.busy_since = Instant::now();
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }

            let row = match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(row))) => row,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => {
                    // Waiting on the producer is not busy time
                    this.busy_since = Instant::now();
                    return Poll::Pending;
                }
            };

            match row.payload {
                Some(payload) => {
                    this.metrics.record_read(payload.len() as u64);
                    return Poll::Ready(Some(Ok(payload)));
                }
                None => error!(
                    "Found unexpected message with NULL payload ({}, ts {}, seq {})",
                    this.debug_info, row.timestamp, row.sequence_no
                ),
            }
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
