//! Behavior tests for operator actions, health reporting, and reference
//! data synchronization.

use std::sync::Arc;

use ebarimt_core::health::{self, CheckStatus};
use ebarimt_core::operator::{self, OperatorError};
use ebarimt_core::{
    reference_data, CircuitState, EbarimtConfig, HttpResponse, ResilientClient,
    ScriptedHttpClient, Service, SourceReference, Store, StoreConfig, SyncError,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

const MANAGER: [&str; 1] = ["System Manager"];
const CASHIER: [&str; 1] = ["Sales User"];

fn client(http: &ScriptedHttpClient, store: Option<Store>) -> ResilientClient {
    let mut builder = ResilientClient::builder(EbarimtConfig::default())
        .with_http_client(Arc::new(http.clone()));
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    builder.build()
}

fn open_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig::in_dir(dir.path())).expect("store opens")
}

fn districts_body() -> String {
    json!({
        "status": 200,
        "msg": "",
        "data": [
            { "branchCode": "23", "branchName": "Улаанбаатар", "subBranchCode": "01", "subBranchName": "Баянгол" },
            { "branchCode": "23", "branchName": "Улаанбаатар", "subBranchCode": "02", "subBranchName": "Баянзүрх" },
            { "branchName": "row without a branch code" }
        ]
    })
    .to_string()
}

fn tax_codes_body() -> String {
    json!({
        "status": 200,
        "data": [
            { "taxProductCode": 305, "taxProductName": "Exported goods", "taxTypeCode": 2, "taxTypeName": "VAT_ZERO" },
            { "taxProductCode": "401", "taxProductName": "Medical services", "taxTypeCode": 3, "taxTypeName": "VAT_FREE", "startDate": "2023-01-01" }
        ]
    })
    .to_string()
}

// =============================================================================
// Operator actions
// =============================================================================

#[tokio::test]
async fn when_a_cashier_calls_operator_actions_then_every_one_is_denied() {
    let client = client(&ScriptedHttpClient::default(), None);

    assert!(matches!(
        operator::queue_status(&client, &CASHIER).await,
        Err(OperatorError::PermissionDenied)
    ));
    assert!(matches!(
        operator::retry_failed_items(&client, &CASHIER).await,
        Err(OperatorError::PermissionDenied)
    ));
    assert!(matches!(
        operator::reset_circuit_breaker(&client, &CASHIER, Service::Pos).await,
        Err(OperatorError::PermissionDenied)
    ));
    assert!(matches!(
        operator::metrics_summary(&client, &CASHIER).await,
        Err(OperatorError::PermissionDenied)
    ));
    assert!(matches!(
        operator::health_report(&client, &CASHIER).await,
        Err(OperatorError::PermissionDenied)
    ));
}

#[tokio::test]
async fn when_a_manager_resets_the_pos_breaker_then_submissions_flow_again() {
    // Given: An open POS breaker
    let http = ScriptedHttpClient::default();
    let client = client(&http, None);
    let breaker = client.breaker(Service::Pos);
    for _ in 0..breaker.config().failure_threshold {
        breaker.record_failure().await;
    }
    assert!(breaker.is_open().await);

    // When: A manager resets it
    let result = operator::reset_circuit_breaker(&client, &MANAGER, Service::Pos)
        .await
        .expect("reset allowed");

    // Then: The breaker reports closed and calls go through
    assert_eq!(result, json!({ "breaker": "pos", "state": "closed" }));
    assert_eq!(breaker.state().await, CircuitState::Closed);
    client.get_info().await.expect("call goes through");
    assert_eq!(http.request_count(), 1);
}

#[tokio::test]
async fn when_a_manager_checks_the_queue_then_counts_and_backend_are_reported() {
    let client = client(&ScriptedHttpClient::default(), None);
    client
        .queue()
        .enqueue(&SourceReference::new("Sales Invoice", "SINV-0100"), json!({}), None)
        .await
        .expect("enqueue");

    let status = operator::queue_status(&client, &MANAGER)
        .await
        .expect("status allowed");

    assert_eq!(status["pending"], 1);
    assert_eq!(status["failed"], 0);
    assert_eq!(status["source"], "cache");

    let reset = operator::retry_failed_items(&client, &MANAGER)
        .await
        .expect("retry allowed");
    assert_eq!(reset, json!({ "reset_count": 0 }));
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn when_the_store_is_open_then_detailed_health_reports_the_database() {
    let dir = tempdir().expect("tempdir");
    let client = client(&ScriptedHttpClient::default(), Some(open_store(&dir)));

    let report = health::detailed_health(&client).await;
    let readiness = health::readiness(&client).await;

    assert_eq!(report.status, CheckStatus::Healthy);
    assert_eq!(report.checks["database"].status, CheckStatus::Healthy);
    assert_eq!(report.checks["cache"].details["backend"], "store");
    assert_eq!(report.checks["pending_queue"].details["source"], "database");
    assert!(readiness.ready);
}

#[tokio::test]
async fn when_the_queue_backs_up_then_health_is_degraded() {
    // Given: More pending receipts than the high-water mark
    let mut config = EbarimtConfig::default();
    config.queue.high_water_mark = 2;
    let client = ResilientClient::builder(config)
        .with_http_client(Arc::new(ScriptedHttpClient::default()))
        .build();
    for name in ["SINV-1", "SINV-2", "SINV-3"] {
        client
            .queue()
            .enqueue(&SourceReference::new("Sales Invoice", name), json!({}), None)
            .await
            .expect("enqueue");
    }

    // When: Detailed health is requested
    let report = health::detailed_health(&client).await;

    // Then: The queue check warns and the service is degraded, not down
    let queue = &report.checks["pending_queue"];
    assert_eq!(queue.status, CheckStatus::Warning);
    assert_eq!(queue.details["pending_count"], 3);
    assert_eq!(report.status, CheckStatus::Degraded);
}

// =============================================================================
// Reference data
// =============================================================================

#[tokio::test]
async fn when_reference_data_is_synced_then_codes_land_in_the_store() {
    // Given: A public API returning districts and tax codes
    let dir = tempdir().expect("tempdir");
    let store = open_store(&dir);
    let http = ScriptedHttpClient::default();
    http.push_status(200, districts_body())
        .push_status(200, tax_codes_body());
    let client = client(&http, Some(store.clone()));

    // When: Reference data is synced
    let report = reference_data::sync_reference_data(&client)
        .await
        .expect("sync succeeds");

    // Then: Valid rows were inserted and the malformed district skipped
    assert_eq!(report.districts.inserted, 2);
    assert_eq!(report.tax_codes.inserted, 2);
    assert_eq!(store.district_count().expect("count"), 2);
    assert_eq!(store.tax_code_count().expect("count"), 2);

    let urls: Vec<String> = http.requests().into_iter().map(|request| request.url).collect();
    assert!(urls[0].ends_with("/api/info/check/getBranchInfo"));
    assert!(urls[1].ends_with("/api/receipt/receipt/getProductTaxCode"));
}

#[tokio::test]
async fn when_reference_data_is_synced_again_then_rows_are_updated_not_duplicated() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(&dir);
    let http = ScriptedHttpClient::default();
    http.push_status(200, districts_body())
        .push_status(200, tax_codes_body())
        .push_status(200, districts_body())
        .push_status(200, tax_codes_body());
    let client = client(&http, Some(store.clone()));

    reference_data::sync_reference_data(&client)
        .await
        .expect("first sync");
    let second = reference_data::sync_reference_data(&client)
        .await
        .expect("second sync");

    assert_eq!(second.districts.inserted, 0);
    assert_eq!(second.districts.updated, 2);
    assert_eq!(second.tax_codes.updated, 2);
    assert_eq!(store.district_count().expect("count"), 2);
}

#[tokio::test]
async fn when_the_api_reports_a_non_200_envelope_then_nothing_is_written() {
    let dir = tempdir().expect("tempdir");
    let store = open_store(&dir);
    let http = ScriptedHttpClient::new(Ok(HttpResponse::ok_json(
        r#"{"status":500,"msg":"maintenance","data":null}"#,
    )));
    let client = client(&http, Some(store.clone()));

    let report = reference_data::sync_reference_data(&client)
        .await
        .expect("sync completes");

    assert_eq!(report, reference_data::ReferenceSyncReport::default());
    assert_eq!(store.district_count().expect("count"), 0);
}

#[tokio::test]
async fn when_no_store_is_configured_then_reference_sync_is_refused() {
    let http = ScriptedHttpClient::default();
    let client = client(&http, None);

    let error = reference_data::sync_reference_data(&client)
        .await
        .expect_err("store required");

    assert!(matches!(error, SyncError::StoreUnavailable));
    assert_eq!(http.request_count(), 0);
}
