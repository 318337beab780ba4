//! Scheduled jobs. Failures are logged and swallowed so a bad pass never
//! takes the scheduler down.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use ebarimt_store::ReceiptLogStatus;

use crate::client::ResilientClient;
use crate::documents::DocumentStore;
use crate::offline_queue::ProcessReport;
use crate::reference_data::{self, ReferenceSyncReport};
use crate::timestamp::UtcDateTime;

pub const REFERENCE_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 3600);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
/// Failed receipt-log entries older than this are deleted.
pub const FAILED_LOG_RETENTION: Duration = Duration::from_secs(5 * 365 * 24 * 3600);

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub cache_entries_purged: usize,
    pub failed_logs_pruned: usize,
}

/// One drain pass of the offline queue.
pub async fn drain_offline_queue(
    client: &ResilientClient,
    documents: &dyn DocumentStore,
) -> ProcessReport {
    if !client.config().enabled {
        tracing::debug!("eBarimt disabled, skipping queue drain");
        return ProcessReport {
            skipped: true,
            reason: Some("eBarimt integration is disabled".to_owned()),
            ..ProcessReport::default()
        };
    }

    match client.drain_queue(documents).await {
        Ok(report) => report,
        Err(error) => {
            tracing::error!(%error, "offline queue job failed");
            ProcessReport {
                skipped: true,
                reason: Some(error.to_string()),
                ..ProcessReport::default()
            }
        }
    }
}

pub async fn sync_reference_data(client: &ResilientClient) -> Option<ReferenceSyncReport> {
    match reference_data::sync_reference_data(client).await {
        Ok(report) => Some(report),
        Err(error) => {
            tracing::error!(%error, "reference data sync failed");
            None
        }
    }
}

/// Drop expired cache entries from the shared cache.
pub async fn purge_expired_cache(client: &ResilientClient) -> usize {
    match client.cache().purge_expired().await {
        Ok(purged) => purged,
        Err(error) => {
            tracing::warn!(%error, backend = client.cache().name(), "cache purge failed");
            0
        }
    }
}

/// Delete failed receipt-log entries created before `now - retention`.
pub fn prune_failed_receipt_logs(client: &ResilientClient, retention: Duration) -> usize {
    let Some(store) = client.store() else {
        return 0;
    };
    let cutoff = UtcDateTime::now().saturating_sub(retention).format_rfc3339();
    match store.prune_receipt_log(ReceiptLogStatus::Failed, &cutoff) {
        Ok(pruned) => pruned,
        Err(error) => {
            tracing::warn!(%error, "receipt log pruning failed");
            0
        }
    }
}

pub async fn run_maintenance(client: &ResilientClient) -> MaintenanceReport {
    let report = MaintenanceReport {
        cache_entries_purged: purge_expired_cache(client).await,
        failed_logs_pruned: prune_failed_receipt_logs(client, FAILED_LOG_RETENTION),
    };
    if report != MaintenanceReport::default() {
        tracing::info!(
            cache_entries_purged = report.cache_entries_purged,
            failed_logs_pruned = report.failed_logs_pruned,
            "worker maintenance pass"
        );
    }
    report
}

/// Drain every `queue.drain_interval`, run maintenance hourly and sync
/// reference data daily until `shutdown` resolves.
pub async fn run_worker<F>(client: &ResilientClient, documents: &dyn DocumentStore, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut drain = tokio::time::interval(client.config().queue.drain_interval);
    drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reference = tokio::time::interval(REFERENCE_SYNC_INTERVAL);
    reference.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    tracing::info!(
        drain_interval_secs = client.config().queue.drain_interval.as_secs(),
        "eBarimt worker started"
    );
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = drain.tick() => {
                let report = drain_offline_queue(client, documents).await;
                if report.processed > 0 {
                    tracing::info!(
                        processed = report.processed,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "worker drain pass"
                    );
                }
            }
            _ = maintenance.tick() => {
                run_maintenance(client).await;
            }
            _ = reference.tick() => {
                if client.store().is_some() {
                    sync_reference_data(client).await;
                }
            }
        }
    }
    tracing::info!("eBarimt worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::EbarimtConfig;
    use crate::documents::MemoryDocumentStore;
    use crate::http_client::ScriptedHttpClient;
    use ebarimt_store::{ReceiptLogRecord, Store, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn client(config: EbarimtConfig) -> ResilientClient {
        ResilientClient::builder(config)
            .with_http_client(Arc::new(ScriptedHttpClient::default()))
            .build()
    }

    #[tokio::test]
    async fn disabled_integration_skips_drain() {
        let config = EbarimtConfig {
            enabled: false,
            ..EbarimtConfig::default()
        };
        let report = drain_offline_queue(&client(config), &MemoryDocumentStore::new()).await;
        assert!(report.skipped);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn reference_sync_without_store_is_swallowed() {
        assert!(sync_reference_data(&client(EbarimtConfig::default())).await.is_none());
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let client = client(EbarimtConfig::default());
        let documents = MemoryDocumentStore::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_worker(&client, &documents, tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .expect("worker returns after shutdown");
    }

    fn failed_log(name: &str, created_at: &str) -> ReceiptLogRecord {
        ReceiptLogRecord {
            id: None,
            source_doctype: "Sales Invoice".to_owned(),
            source_name: name.to_owned(),
            status: ReceiptLogStatus::Failed,
            bill_type: Some("B2C_RECEIPT".to_owned()),
            receipt_id: None,
            lottery: None,
            qr_data: None,
            queue_id: None,
            error: Some("timeout".to_owned()),
            duration_ms: Some(30_000),
            created_at: created_at.to_owned(),
        }
    }

    #[tokio::test]
    async fn maintenance_purges_expired_cache_entries() {
        // Given: an expired token and a durable breaker record in the shared cache
        let cache = Arc::new(MemoryCache::new());
        cache
            .set("token:pos", json!("abc"), Some(Duration::from_millis(5)))
            .await
            .expect("set");
        cache.set("circuit_breaker:pos", json!({"state": "closed"}), None).await.expect("set");
        let client = ResilientClient::builder(EbarimtConfig::default())
            .with_http_client(Arc::new(ScriptedHttpClient::default()))
            .with_cache(cache.clone())
            .build();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // When
        let report = run_maintenance(&client).await;

        // Then
        assert_eq!(report.cache_entries_purged, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn maintenance_prunes_failed_logs_past_retention() {
        // Given: one failed entry from years ago and one from today
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");
        store
            .append_receipt_log(&failed_log("INV-OLD", "2015-03-01T08:00:00Z"))
            .expect("append");
        store
            .append_receipt_log(&failed_log("INV-NEW", &UtcDateTime::now().format_rfc3339()))
            .expect("append");
        let client = ResilientClient::builder(EbarimtConfig::default())
            .with_http_client(Arc::new(ScriptedHttpClient::default()))
            .with_store(store.clone())
            .build();

        // When
        let report = run_maintenance(&client).await;

        // Then
        assert_eq!(report.failed_logs_pruned, 1);
        assert_eq!(prune_failed_receipt_logs(&client, FAILED_LOG_RETENTION), 0);
        assert_eq!(store.receipt_log_stats().expect("stats").failed, 1);
    }

    #[test]
    fn pruning_without_store_is_a_no_op() {
        assert_eq!(prune_failed_receipt_logs(&client(EbarimtConfig::default()), Duration::ZERO), 0);
    }
}
