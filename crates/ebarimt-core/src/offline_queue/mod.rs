//! Offline receipt queue.
//!
//! Receipts that could not reach the POS API are parked here and drained by a
//! periodic job through the same resilient path. At most one Pending or
//! Processing item exists per source document.

mod backend;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use ebarimt_store::{PendingReceiptRecord, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

pub use backend::{
    select_backend, CacheQueueBackend, QueueBackend, QueueFuture, StoreQueueBackend,
    CACHE_QUEUE_KEY,
};
pub use ebarimt_store::{EnqueueOutcome, QueueStatus};

use crate::cache::Cache;
use crate::circuit_breaker::CircuitBreaker;
use crate::documents::DocumentStore;
use crate::error::{ClientError, QueueError};
use crate::logging::CorrelationId;
use crate::middleware::BoxFuture;
use crate::receipt::ReceiptResponse;
use crate::timestamp::UtcDateTime;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_PRIORITY: i32 = 5;
const MAX_ERROR_LEN: usize = 500;

/// Document type and name of the document a receipt belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceReference {
    pub doctype: String,
    pub name: String,
}

impl SourceReference {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
        }
    }
}

impl Display for SourceReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.doctype, self.name)
    }
}

/// A queued receipt submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub source: SourceReference,
    pub payload: Value,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// 1 is most urgent, 10 least.
    pub priority: i32,
    pub created_at: UtcDateTime,
    pub modified_at: UtcDateTime,
    /// Version stamp of the source document the payload was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_modified: Option<String>,
}

impl QueueItem {
    pub fn new(source: SourceReference, payload: Value, priority: i32) -> Self {
        let now = UtcDateTime::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            payload,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            priority,
            created_at: now,
            modified_at: now,
            document_modified: None,
        }
    }

    pub fn with_document_modified(mut self, modified: impl Into<String>) -> Self {
        self.document_modified = Some(modified.into());
        self
    }

    /// Whether the payload was built from document version `modified`.
    /// Items queued without a version stamp match any version.
    pub fn is_version(&self, modified: &str) -> bool {
        self.document_modified
            .as_deref()
            .is_none_or(|queued| queued == modified)
    }

    pub fn from_record(record: PendingReceiptRecord) -> Result<Self, QueueError> {
        Ok(Self {
            payload: serde_json::from_str(&record.payload)?,
            created_at: parse_timestamp(&record.created_at)?,
            modified_at: parse_timestamp(&record.modified_at)?,
            id: record.id,
            source: SourceReference::new(record.source_doctype, record.source_name),
            status: record.status,
            retry_count: record.retry_count,
            last_error: record.last_error,
            priority: record.priority,
            document_modified: record.document_modified,
        })
    }

    pub fn to_record(&self) -> PendingReceiptRecord {
        PendingReceiptRecord {
            id: self.id.clone(),
            source_doctype: self.source.doctype.clone(),
            source_name: self.source.name.clone(),
            payload: self.payload.to_string(),
            status: self.status,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            priority: self.priority,
            created_at: self.created_at.format_rfc3339(),
            modified_at: self.modified_at.format_rfc3339(),
            document_modified: self.document_modified.clone(),
        }
    }

    fn touch(&mut self) {
        self.modified_at = UtcDateTime::now();
    }
}

fn parse_timestamp(value: &str) -> Result<UtcDateTime, QueueError> {
    UtcDateTime::parse(value).map_err(|_| QueueError::InvalidTimestamp(value.to_owned()))
}

/// Item counts per status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// Backend holding the queue: `database` or `cache`.
    pub source: String,
}

impl QueueStats {
    pub fn empty(source: &str) -> Self {
        Self {
            pending: 0,
            processing: 0,
            failed: 0,
            completed: 0,
            cancelled: 0,
            source: source.to_owned(),
        }
    }

    pub fn add(&mut self, status: QueueStatus, count: u64) {
        let slot = match status {
            QueueStatus::Pending => &mut self.pending,
            QueueStatus::Processing => &mut self.processing,
            QueueStatus::Failed => &mut self.failed,
            QueueStatus::Completed => &mut self.completed,
            QueueStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Sends a queued receipt to the POS API.
pub trait ReceiptProcessor: Send + Sync {
    fn process<'a>(&'a self, item: &'a QueueItem)
        -> BoxFuture<'a, Result<ReceiptResponse, ClientError>>;
}

pub struct OfflineQueue {
    backend: Arc<dyn QueueBackend>,
    breaker: Option<Arc<CircuitBreaker>>,
    max_retries: u32,
    default_priority: i32,
}

impl OfflineQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            breaker: None,
            max_retries: DEFAULT_MAX_RETRIES,
            default_priority: DEFAULT_PRIORITY,
        }
    }

    /// Durable store when it has the queue table, otherwise the cache list.
    pub fn open(store: Option<&Store>, cache: Arc<dyn Cache>) -> Self {
        Self::new(select_backend(store, cache))
    }

    /// Gate drains on `breaker`: nothing is processed while it is open.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub const fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Queue a receipt, or return the id of the active item already queued
    /// for the same source.
    pub async fn enqueue(
        &self,
        source: &SourceReference,
        payload: Value,
        priority: Option<i32>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let item = QueueItem::new(
            source.clone(),
            payload,
            priority.unwrap_or(self.default_priority),
        );
        self.insert(item).await
    }

    /// [`Self::enqueue`] for the receipt of one document version.
    pub async fn enqueue_version(
        &self,
        source: &SourceReference,
        document_modified: &str,
        payload: Value,
        priority: Option<i32>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let item = QueueItem::new(
            source.clone(),
            payload,
            priority.unwrap_or(self.default_priority),
        )
        .with_document_modified(document_modified);
        self.insert(item).await
    }

    async fn insert(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError> {
        let source = item.source.clone();
        let outcome = self.backend.enqueue(item).await?;
        match &outcome {
            EnqueueOutcome::Created(id) => {
                tracing::info!(queue_id = %id, source = %source, backend = self.backend.name(), "receipt queued");
            }
            EnqueueOutcome::Existing(id) => {
                tracing::info!(queue_id = %id, source = %source, "receipt already queued");
            }
        }
        Ok(outcome)
    }

    /// The Pending or Processing item of `source`, if any.
    pub async fn find_active(
        &self,
        source: &SourceReference,
    ) -> Result<Option<QueueItem>, QueueError> {
        self.backend.active_for(source).await
    }

    /// Swap the payload of a Pending item for a newer document version.
    /// Items already being processed are left as they are.
    pub async fn replace_pending(
        &self,
        id: &str,
        document_modified: &str,
        payload: Value,
    ) -> Result<QueueItem, QueueError> {
        let item = self
            .transition(id, |item| {
                if item.status == QueueStatus::Pending {
                    item.payload = payload;
                    item.document_modified = Some(document_modified.to_owned());
                }
            })
            .await?;
        tracing::info!(queue_id = %item.id, source = %item.source, document_modified, "queued receipt moved to a newer document version");
        Ok(item)
    }

    pub async fn get_pending_items(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        self.backend.pending(limit, self.max_retries).await
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        self.backend.get(id).await
    }

    pub async fn mark_processing(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.transition(id, |item| item.status = QueueStatus::Processing)
            .await
    }

    /// Mark an item Completed and return its payload.
    pub async fn dequeue(&self, id: &str) -> Result<Value, QueueError> {
        let item = self
            .transition(id, |item| item.status = QueueStatus::Completed)
            .await?;
        Ok(item.payload)
    }

    /// Record a failed attempt. The item goes back to Pending while retries
    /// remain and stays Failed once `retry_count` reaches the maximum.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<QueueItem, QueueError> {
        let max_retries = self.max_retries;
        let item = self
            .transition(id, |item| {
                item.retry_count = item.retry_count.saturating_add(1);
                item.last_error = Some(error.chars().take(MAX_ERROR_LEN).collect());
                item.status = if item.retry_count < max_retries {
                    QueueStatus::Pending
                } else {
                    QueueStatus::Failed
                };
            })
            .await?;
        if item.status == QueueStatus::Failed {
            tracing::error!(
                queue_id = %item.id,
                source = %item.source,
                retries = item.retry_count,
                error,
                "queued receipt exhausted its retries"
            );
        }
        Ok(item)
    }

    pub async fn cancel(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.transition(id, |item| item.status = QueueStatus::Cancelled)
            .await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    /// Operator retry: every Failed item back to Pending with a fresh budget.
    pub async fn retry_failed_items(&self) -> Result<usize, QueueError> {
        let reset = self.backend.reset_failed().await?;
        tracing::info!(reset, "failed queue items reset to pending");
        Ok(reset)
    }

    /// Drain up to `batch_size` pending items through `processor`.
    ///
    /// Nothing is processed while the breaker is open. Successful items are
    /// completed and their receipt is written back to the source document.
    pub async fn process_queue(
        &self,
        batch_size: usize,
        processor: &dyn ReceiptProcessor,
        documents: &dyn DocumentStore,
    ) -> Result<ProcessReport, QueueError> {
        let span = tracing::info_span!(
            "offline_queue_drain",
            correlation_id = %CorrelationId::new(),
            batch_size
        );
        self.drain(batch_size, processor, documents)
            .instrument(span)
            .await
    }

    async fn drain(
        &self,
        batch_size: usize,
        processor: &dyn ReceiptProcessor,
        documents: &dyn DocumentStore,
    ) -> Result<ProcessReport, QueueError> {
        if let Some(breaker) = &self.breaker {
            if breaker.is_open().await {
                tracing::info!(breaker = breaker.name(), "skipping queue drain, circuit breaker is open");
                return Ok(ProcessReport::skipped("Circuit breaker is open"));
            }
        }

        let mut report = ProcessReport::default();
        for item in self.get_pending_items(batch_size).await? {
            let item = self.mark_processing(&item.id).await?;

            match processor.process(&item).await {
                Ok(receipt) => {
                    self.dequeue(&item.id).await?;
                    if let Err(error) = documents.apply_receipt(&item.source, &receipt).await {
                        tracing::warn!(source = %item.source, %error, "could not update source document");
                    }
                    report.succeeded += 1;
                    report.processed += 1;
                }
                Err(ClientError::CircuitOpen(error)) => {
                    // Not an attempt: return the item untouched and stop the pass.
                    self.transition(&item.id, |item| item.status = QueueStatus::Pending)
                        .await?;
                    report.skipped = true;
                    report.reason = Some(error.to_string());
                    break;
                }
                Err(error) => {
                    tracing::warn!(queue_id = %item.id, source = %item.source, %error, "queued receipt failed");
                    self.mark_failed(&item.id, &error.to_string()).await?;
                    report.failed += 1;
                    report.processed += 1;
                }
            }
        }

        if report.processed > 0 {
            tracing::info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                "offline queue processed"
            );
        }
        Ok(report)
    }

    async fn transition<F>(&self, id: &str, change: F) -> Result<QueueItem, QueueError>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut item = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_owned()))?;
        change(&mut item);
        item.touch();
        self.backend.update(item.clone()).await?;
        Ok(item)
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("backend", &self.backend.name())
            .field("max_retries", &self.max_retries)
            .field("default_priority", &self.default_priority)
            .finish()
    }
}
