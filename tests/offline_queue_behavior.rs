//! Behavior tests for the offline receipt queue.
//!
//! These tests check how parked receipts survive restarts, in which order
//! they are drained, how failures consume the retry budget, and when a drain
//! pass is skipped.

use std::sync::Arc;
use std::time::Duration;

use ebarimt_core::config::ServiceEndpoints;
use ebarimt_core::offline_queue::EnqueueOutcome;
use ebarimt_core::{
    Cache, EbarimtConfig, HttpResponse, MemoryCache, MemoryDocumentStore, OfflineQueue,
    QueueStatus, ResilientClient, RetryConfig, ScriptedHttpClient, Service, SourceReference, Store,
    StoreConfig,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

const RECEIPT_OK: &str = r#"{"status":"SUCCESS","billId":"000000000000000000000000000000001","lottery":"AB 12345678","qrData":"QR-1"}"#;

fn open_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig::in_dir(dir.path())).expect("store opens")
}

fn invoice(name: &str) -> SourceReference {
    SourceReference::new("Sales Invoice", name)
}

fn config() -> EbarimtConfig {
    let mut config = EbarimtConfig::default();
    config.api.pos = ServiceEndpoints::new("http://pos.test/rest", &[]);
    config.retry = RetryConfig::no_retry();
    config
}

fn client(config: EbarimtConfig, http: &ScriptedHttpClient, store: Option<Store>) -> ResilientClient {
    let mut builder = ResilientClient::builder(config).with_http_client(Arc::new(http.clone()));
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    builder.build()
}

// =============================================================================
// Offline Queue: Persistence
// =============================================================================

#[tokio::test]
async fn when_the_store_is_reopened_then_queued_receipts_are_still_pending() {
    // Given: A receipt queued in the durable store
    let dir = tempdir().expect("tempdir");
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let queue = OfflineQueue::open(Some(&open_store(&dir)), Arc::clone(&cache));
    assert_eq!(queue.backend_name(), "database");
    let queued = queue
        .enqueue(&invoice("SINV-0001"), json!({ "totalAmount": 1100.0 }), None)
        .await
        .expect("enqueue");

    // When: The process restarts with a fresh cache
    let reopened = OfflineQueue::open(Some(&open_store(&dir)), Arc::new(MemoryCache::new()));

    // Then: The item is still pending with its payload intact
    let pending = reopened.get_pending_items(10).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queued.id());
    assert_eq!(pending[0].source, invoice("SINV-0001"));
    assert_eq!(pending[0].payload["totalAmount"], 1100.0);
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test]
async fn when_no_store_is_available_then_the_queue_lives_in_the_cache() {
    let queue = OfflineQueue::open(None, Arc::new(MemoryCache::new()));

    queue
        .enqueue(&invoice("SINV-0002"), json!({}), Some(3))
        .await
        .expect("enqueue");

    let stats = queue.queue_stats().await.expect("stats");
    assert_eq!(queue.backend_name(), "cache");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.source, "cache");
}

#[tokio::test]
async fn when_a_document_is_queued_twice_then_the_first_item_is_reused() {
    // Given: A receipt already waiting for SINV-0003
    let dir = tempdir().expect("tempdir");
    let queue = OfflineQueue::open(Some(&open_store(&dir)), Arc::new(MemoryCache::new()));
    let first = queue
        .enqueue(&invoice("SINV-0003"), json!({ "version": 1 }), None)
        .await
        .expect("first enqueue");

    // When: The same document is queued again
    let second = queue
        .enqueue(&invoice("SINV-0003"), json!({ "version": 2 }), None)
        .await
        .expect("second enqueue");

    // Then: No second item exists
    assert!(matches!(first, EnqueueOutcome::Created(_)));
    assert_eq!(second, EnqueueOutcome::Existing(first.id().to_string()));
    assert_eq!(queue.queue_stats().await.expect("stats").pending, 1);
}

// =============================================================================
// Offline Queue: Draining
// =============================================================================

#[tokio::test]
async fn when_the_queue_drains_then_urgent_receipts_go_first_and_documents_are_updated() {
    // Given: Two queued receipts with different priorities and a healthy terminal
    let dir = tempdir().expect("tempdir");
    let http = ScriptedHttpClient::new(Ok(HttpResponse::ok_json(RECEIPT_OK)));
    let client = client(config(), &http, Some(open_store(&dir)));
    client
        .queue()
        .enqueue(&invoice("SINV-LOW"), json!({ "invoice": "low" }), Some(9))
        .await
        .expect("enqueue low");
    client
        .queue()
        .enqueue(&invoice("SINV-URGENT"), json!({ "invoice": "urgent" }), Some(1))
        .await
        .expect("enqueue urgent");
    let documents = MemoryDocumentStore::new();

    // When: The queue is drained
    let report = client.drain_queue(&documents).await.expect("drain");

    // Then: Both were submitted, the urgent one first, and both documents carry the receipt
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    let bodies: Vec<String> = http
        .requests()
        .into_iter()
        .filter_map(|request| request.body)
        .collect();
    assert!(bodies[0].contains("urgent"));
    assert!(bodies[1].contains("low"));

    let fields = documents
        .receipt_for(&invoice("SINV-URGENT"))
        .expect("document updated");
    assert_eq!(fields.bill_id.as_deref(), Some("000000000000000000000000000000001"));
    assert_eq!(fields.lottery.as_deref(), Some("AB 12345678"));
    assert_eq!(documents.len(), 2);

    let stats = client.queue().queue_stats().await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn when_a_queued_receipt_keeps_failing_then_it_ends_failed_until_an_operator_retries() {
    // Given: A queue allowing two attempts and a terminal rejecting the payload
    let dir = tempdir().expect("tempdir");
    let http = ScriptedHttpClient::new(Ok(HttpResponse::new(
        400,
        r#"{"message":"merchant TIN is not registered"}"#,
    )));
    let mut config = config();
    config.queue.max_retries = 2;
    let client = client(config, &http, Some(open_store(&dir)));
    let queued = client
        .queue()
        .enqueue(&invoice("SINV-0004"), json!({}), None)
        .await
        .expect("enqueue");
    let documents = MemoryDocumentStore::new();

    // When: Two drain passes fail and a third finds nothing to do
    let first = client.drain_queue(&documents).await.expect("first drain");
    let after_first = client.queue().get_item(queued.id()).await.expect("get").expect("item");
    let second = client.drain_queue(&documents).await.expect("second drain");
    let third = client.drain_queue(&documents).await.expect("third drain");

    // Then: The item went back to pending once, then stayed failed with the last error
    assert_eq!(first.failed, 1);
    assert_eq!(after_first.status, QueueStatus::Pending);
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(third.processed, 0);

    let item = client.queue().get_item(queued.id()).await.expect("get").expect("item");
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.retry_count, 2);
    assert!(item
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("merchant TIN is not registered")));
    assert!(documents.is_empty());

    // When: An operator resets failed items
    let reset = client.queue().retry_failed_items().await.expect("reset");

    // Then: The item is pending again with a fresh budget
    assert_eq!(reset, 1);
    let item = client.queue().get_item(queued.id()).await.expect("get").expect("item");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 0);
}

#[tokio::test]
async fn when_the_pos_breaker_is_open_then_a_drain_pass_is_skipped() {
    // Given: A queued receipt and an open POS breaker
    let http = ScriptedHttpClient::new(Ok(HttpResponse::ok_json(RECEIPT_OK)));
    let client = client(config(), &http, None);
    client
        .queue()
        .enqueue(&invoice("SINV-0005"), json!({}), None)
        .await
        .expect("enqueue");
    let breaker = client.breaker(Service::Pos);
    for _ in 0..breaker.config().failure_threshold {
        breaker.record_failure().await;
    }

    // When: The queue is drained
    let report = client
        .drain_queue(&MemoryDocumentStore::new())
        .await
        .expect("drain");

    // Then: Nothing was sent and the item is untouched
    assert!(report.skipped);
    assert_eq!(report.reason.as_deref(), Some("Circuit breaker is open"));
    assert_eq!(http.request_count(), 0);
    let stats = client.queue().queue_stats().await.expect("stats");
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn when_the_breaker_opens_mid_drain_then_remaining_items_stay_pending_without_penalty() {
    // Given: Three queued receipts and a terminal that goes down after the first
    let http = ScriptedHttpClient::new(Ok(HttpResponse::new(503, "")));
    http.push(Ok(HttpResponse::ok_json(RECEIPT_OK)));
    let mut config = config();
    config.breaker.pos.failure_threshold = 1;
    config.breaker.pos.recovery_timeout = Duration::from_secs(60);
    let client = client(config, &http, None);
    for name in ["SINV-A", "SINV-B", "SINV-C"] {
        client
            .queue()
            .enqueue(&invoice(name), json!({ "invoice": name }), None)
            .await
            .expect("enqueue");
    }

    // When: One drain pass runs
    let report = client
        .drain_queue(&MemoryDocumentStore::new())
        .await
        .expect("drain");

    // Then: One success, one counted failure, and the pass stopped at the open breaker
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(report.skipped);
    assert_eq!(http.request_count(), 2);

    let pending = client.queue().get_pending_items(10).await.expect("pending");
    assert_eq!(pending.len(), 2);
    let untouched = pending
        .iter()
        .find(|item| item.source == invoice("SINV-C"))
        .expect("third item still queued");
    assert_eq!(untouched.retry_count, 0);
}
