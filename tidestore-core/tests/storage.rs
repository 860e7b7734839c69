//! End-to-end tests of the storage façade over the embedded column store

mod common;

use bytes::Bytes;
use common::{fast_config, init_tracing, record, timestamps, wait_until, FailingStore};
use futures::future::join_all;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tidestore_core::column::{BucketQuery, BucketRow, ColumnStore, DataRow, MemoryColumnStore};
use tidestore_core::journal::JournalConfig;
use tidestore_core::query::{Position, RangeRequest};
use tidestore_core::storage::Storage;
use tidestore_core::{BucketId, Record, StoreError, StreamPartition};

fn s1() -> StreamPartition {
    StreamPartition::new("s1", 0)
}

async fn bucket_rows(store: &dyn ColumnStore, stream: &StreamPartition) -> Vec<BucketRow> {
    store
        .query_buckets(stream, BucketQuery::Range { after: None, until: None })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_twenty_five_messages_in_three_buckets() {
    init_tracing();
    let store = Arc::new(MemoryColumnStore::new());
    let storage = Storage::new(store.clone(), fast_config(10)).unwrap();

    for i in 1..=25 {
        storage.store(record(&s1(), i * 1000, 0)).await.unwrap();
    }
    wait_until(|| async { storage.message_count(&s1()).await.unwrap() == 25 }).await;

    let buckets = bucket_rows(store.as_ref(), &s1()).await;
    let dates: Vec<_> = buckets.iter().map(|b| b.date_create).collect();
    assert_eq!(dates, vec![21000, 11000, 1000]);

    let last = storage.request_last(&s1(), 5).collect_payloads().await.unwrap();
    assert_eq!(timestamps(&last), vec![21000, 22000, 23000, 24000, 25000]);

    let request = RangeRequest::new(s1(), Position::new(1000, 0), Position::new(25000, 0));
    let all = storage.request_range(request).unwrap().collect_payloads().await.unwrap();
    let expected: Vec<i64> = (1..=25).map(|i| i * 1000).collect();
    assert_eq!(timestamps(&all), expected);

    let metrics = storage.metrics();
    assert_eq!(metrics.messages_written, 25);
    assert_eq!(metrics.messages_read, 30);
}

#[tokio::test]
async fn test_concurrent_stores_round_trip() {
    init_tracing();
    let store = Arc::new(MemoryColumnStore::new());
    let storage = Storage::new(store.clone(), fast_config(5)).unwrap();

    // Arrival order differs from timestamp order
    let mut order: Vec<i64> = (1..=37).collect();
    order.reverse();
    order.rotate_left(11);

    let results = join_all(
        order
            .iter()
            .map(|i| storage.store(record(&s1(), i * 100, 0))),
    )
    .await;
    assert!(results.iter().all(|r| r.is_ok()));
    wait_until(|| async { storage.message_count(&s1()).await.unwrap() == 37 }).await;
    assert!(bucket_rows(store.as_ref(), &s1()).await.len() >= 2);

    let all = storage
        .request_from(&s1(), Position::start_of(0), None)
        .unwrap()
        .collect_payloads()
        .await
        .unwrap();
    let expected: Vec<i64> = (1..=37).map(|i| i * 100).collect();
    assert_eq!(timestamps(&all), expected);
}

#[tokio::test]
async fn test_request_last_is_capped() {
    let store = Arc::new(MemoryColumnStore::new());
    let storage = Storage::new(store.clone(), fast_config(10)).unwrap();

    // Two large buckets written straight to the column store
    for (date_create, range) in [(0i64, 0..6000i64), (6000, 6000..12000)] {
        let id = BucketId::generate(date_create);
        store
            .upsert_bucket(BucketRow {
                stream_id: "s1".into(),
                partition: 0,
                date_create,
                id,
                records: 6000,
                size: 6000,
            })
            .await
            .unwrap();
        let rows = range
            .map(|ts| DataRow::from_record(id, &record(&s1(), ts, 0)))
            .collect();
        store.insert_rows(rows, None).await.unwrap();
    }

    let last = storage.request_last(&s1(), 50_000).collect_payloads().await.unwrap();
    assert_eq!(last.len(), 10_000);
    let ts = timestamps(&last);
    assert_eq!(ts.first(), Some(&2000));
    assert_eq!(ts.last(), Some(&11999));
    assert!(ts.windows(2).all(|w| w[0] < w[1]));

    let few = storage.request_last(&s1(), 3).collect_payloads().await.unwrap();
    assert_eq!(timestamps(&few), vec![11997, 11998, 11999]);
}

#[tokio::test]
async fn test_request_last_edge_cases() {
    let storage = Storage::new(Arc::new(MemoryColumnStore::new()), fast_config(10)).unwrap();

    assert!(storage.request_last(&s1(), 10).collect_payloads().await.unwrap().is_empty());

    storage.store(record(&s1(), 1000, 0)).await.unwrap();
    wait_until(|| async { storage.message_count(&s1()).await.unwrap() == 1 }).await;
    assert!(storage.request_last(&s1(), 0).collect_payloads().await.unwrap().is_empty());
    assert_eq!(storage.request_last(&s1(), 10).collect_payloads().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_publisher_filter_is_rejected_before_querying() {
    let store = FailingStore::new();
    store.fail_queries.store(true, Ordering::SeqCst);
    let storage = Storage::new(store.clone(), fast_config(10)).unwrap();

    let mut request = RangeRequest::new(s1(), Position::start_of(0), Position::end_of(5000));
    request.publisher_id = Some("publisher".into());
    assert!(matches!(storage.request_range(request), Err(StoreError::Validation(_))));

    let mut request = RangeRequest::new(s1(), Position::start_of(0), Position::end_of(5000));
    request.msg_chain_id = Some("chain".into());
    assert!(matches!(storage.request_range(request), Err(StoreError::Validation(_))));

    // A valid request reaches the store and surfaces its failure
    let request = RangeRequest::new(s1(), Position::start_of(0), Position::end_of(5000));
    let mut stream = storage.request_range(request).unwrap();
    assert!(matches!(stream.next().await, Some(Err(StoreError::Query(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_publisher_and_sequence_filters() {
    let storage = Storage::new(Arc::new(MemoryColumnStore::new()), fast_config(100)).unwrap();
    let key = s1();

    let mut records = Vec::new();
    for ts in [1000, 2000, 3000] {
        for seq in 0..3 {
            for (publisher, chain) in [("alice", "a1"), ("bob", "b1")] {
                let payload = format!("{}-{}-{}", publisher, ts, seq);
                records.push(Record::new(&key, ts, seq, publisher, chain, payload));
            }
        }
    }
    for result in join_all(records.into_iter().map(|r| storage.store(r))).await {
        result.unwrap();
    }
    wait_until(|| async { storage.message_count(&key).await.unwrap() == 18 }).await;

    let request = RangeRequest::new(key.clone(), Position::new(1000, 1), Position::new(3000, 1))
        .with_publisher("alice", "a1");
    let payloads = storage.request_range(request).unwrap().collect_payloads().await.unwrap();
    let expected: Vec<Bytes> = [
        "alice-1000-1",
        "alice-1000-2",
        "alice-2000-0",
        "alice-2000-1",
        "alice-2000-2",
        "alice-3000-0",
        "alice-3000-1",
    ]
    .iter()
    .map(|s| Bytes::from(s.to_string()))
    .collect();
    assert_eq!(payloads, expected);

    let from = storage
        .request_from(&key, Position::new(3000, 2), Some(("bob", "b1")))
        .unwrap()
        .collect_payloads()
        .await
        .unwrap();
    assert_eq!(from, vec![Bytes::from("bob-3000-2")]);
}

#[tokio::test]
async fn test_exhausted_batch_fails_store() {
    let store = FailingStore::new();
    store.fail_inserts.store(true, Ordering::SeqCst);
    let mut config = fast_config(10);
    config.batch.max_retries = 2;
    let storage = Storage::new(store.clone(), config).unwrap();

    let result = storage.store(record(&s1(), 1000, 0)).await;
    assert!(matches!(result, Err(StoreError::BatchDropped(_))));
    assert_eq!(store.insert_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(storage.stats().batches.pending_batches, 0);
    assert_eq!(storage.metrics().messages_written, 0);
}

#[tokio::test]
async fn test_close_ends_in_flight_store() {
    let store = FailingStore::new();
    store.fail_inserts.store(true, Ordering::SeqCst);
    let mut config = fast_config(10);
    config.batch.max_retries = 1000;
    config.batch.close_timeout = Duration::from_millis(50);
    let storage = Arc::new(Storage::new(store.clone(), config).unwrap());

    let writer = {
        let storage = Arc::clone(&storage);
        tokio::spawn(async move { storage.store(record(&s1(), 1000, 0)).await })
    };
    wait_until(|| async { store.insert_attempts.load(Ordering::SeqCst) >= 1 }).await;

    storage.close();
    let result = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StoreError::Closed)));
    assert_eq!(storage.stats().batches.pending_batches, 0);
}

#[tokio::test]
async fn test_journaled_store_survives_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let journal = JournalConfig::in_dir(temp_dir.path());

    {
        let store = Arc::new(MemoryColumnStore::open(journal.clone()).unwrap());
        let storage = Storage::new(store.clone(), fast_config(4)).unwrap();
        for i in 1..=10 {
            storage.store(record(&s1(), i * 10, 0)).await.unwrap();
        }
        wait_until(|| async { storage.message_count(&s1()).await.unwrap() == 10 }).await;
        storage.close();
        store.sync().unwrap();
    }

    let store = Arc::new(MemoryColumnStore::open(journal).unwrap());
    let storage = Storage::new(store, fast_config(4)).unwrap();
    let all = storage
        .request_from(&s1(), Position::start_of(0), None)
        .unwrap()
        .collect_payloads()
        .await
        .unwrap();
    assert_eq!(timestamps(&all), (1..=10).map(|i| i * 10).collect::<Vec<_>>());
    assert_eq!(storage.first_message_timestamp(&s1()).await.unwrap(), 10);
    assert_eq!(storage.last_message_timestamp(&s1()).await.unwrap(), 100);
}
