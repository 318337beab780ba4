//! Storage for queued receipts.
//!
//! [`StoreQueueBackend`] keeps items in the durable `pending_receipts` table.
//! [`CacheQueueBackend`] keeps a serialized list in the shared cache and is
//! used when the durable table is not available.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ebarimt_store::{EnqueueOutcome, QueueStatus, Store};
use tokio::sync::Mutex;

use super::{QueueItem, QueueStats, SourceReference};
use crate::cache::Cache;
use crate::error::QueueError;

pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

pub const CACHE_QUEUE_KEY: &str = "ebarimt:offline_queue";

/// Storage operations the offline queue needs.
pub trait QueueBackend: Send + Sync {
    /// `database` or `cache`, reported in queue stats.
    fn name(&self) -> &'static str;

    /// Insert `item` unless an active item exists for the same source.
    fn enqueue<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, EnqueueOutcome>;

    /// Pending items with `retry_count < max_retries`, by priority then age.
    fn pending<'a>(&'a self, limit: usize, max_retries: u32) -> QueueFuture<'a, Vec<QueueItem>>;

    fn get<'a>(&'a self, id: &'a str) -> QueueFuture<'a, Option<QueueItem>>;

    /// The Pending or Processing item of `source`.
    fn active_for<'a>(&'a self, source: &'a SourceReference) -> QueueFuture<'a, Option<QueueItem>>;

    /// Persist a changed item. Fails with [`QueueError::NotFound`] for unknown ids.
    fn update<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, ()>;

    fn stats<'a>(&'a self) -> QueueFuture<'a, QueueStats>;

    /// Failed items back to Pending with `retry_count = 0`. Returns how many.
    fn reset_failed<'a>(&'a self) -> QueueFuture<'a, usize>;
}

/// Durable backend over the store's `pending_receipts` table.
#[derive(Clone)]
pub struct StoreQueueBackend {
    store: Store,
}

impl StoreQueueBackend {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl QueueBackend for StoreQueueBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    fn enqueue<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, EnqueueOutcome> {
        Box::pin(async move { Ok(self.store.enqueue_receipt(&item.to_record())?) })
    }

    fn pending<'a>(&'a self, limit: usize, max_retries: u32) -> QueueFuture<'a, Vec<QueueItem>> {
        Box::pin(async move {
            self.store
                .pending_receipts(limit, max_retries)?
                .into_iter()
                .map(QueueItem::from_record)
                .collect()
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> QueueFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            self.store
                .get_receipt(id)?
                .map(QueueItem::from_record)
                .transpose()
        })
    }

    fn active_for<'a>(&'a self, source: &'a SourceReference) -> QueueFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            self.store
                .active_receipt_for(&source.doctype, &source.name)?
                .map(QueueItem::from_record)
                .transpose()
        })
    }

    fn update<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            if self.store.update_receipt(&item.to_record())? {
                Ok(())
            } else {
                Err(QueueError::NotFound(item.id))
            }
        })
    }

    fn stats<'a>(&'a self) -> QueueFuture<'a, QueueStats> {
        Box::pin(async move {
            let mut stats = QueueStats::empty(self.name());
            for (status, count) in self.store.receipt_status_counts()? {
                stats.add(status, count);
            }
            Ok(stats)
        })
    }

    fn reset_failed<'a>(&'a self) -> QueueFuture<'a, usize> {
        Box::pin(async move {
            let now = crate::timestamp::UtcDateTime::now().format_rfc3339();
            Ok(self.store.reset_failed_receipts(&now)?)
        })
    }
}

/// Fallback backend holding the queue as one JSON list in the shared cache.
///
/// Completed and cancelled items are dropped from the list. Updates are
/// serialized within this process only; processes sharing the cache can
/// race, so deduplication here is best-effort.
pub struct CacheQueueBackend {
    cache: Arc<dyn Cache>,
    lock: Mutex<()>,
}

impl CacheQueueBackend {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<QueueItem>, QueueError> {
        match self.cache.get(CACHE_QUEUE_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        self.cache
            .set(CACHE_QUEUE_KEY, serde_json::to_value(items)?, None)
            .await?;
        Ok(())
    }
}

impl QueueBackend for CacheQueueBackend {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn enqueue<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, EnqueueOutcome> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut items = self.load().await?;
            if let Some(existing) = items
                .iter()
                .find(|existing| existing.status.is_active() && existing.source == item.source)
            {
                return Ok(EnqueueOutcome::Existing(existing.id.clone()));
            }

            let id = item.id.clone();
            items.push(item);
            self.save(&items).await?;
            Ok(EnqueueOutcome::Created(id))
        })
    }

    fn pending<'a>(&'a self, limit: usize, max_retries: u32) -> QueueFuture<'a, Vec<QueueItem>> {
        Box::pin(async move {
            let mut pending: Vec<QueueItem> = self
                .load()
                .await?
                .into_iter()
                .filter(|item| item.status == QueueStatus::Pending && item.retry_count < max_retries)
                .collect();
            pending.sort_by(|left, right| {
                left.priority
                    .cmp(&right.priority)
                    .then(left.created_at.cmp(&right.created_at))
            });
            pending.truncate(limit);
            Ok(pending)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> QueueFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            Ok(self.load().await?.into_iter().find(|item| item.id == id))
        })
    }

    fn active_for<'a>(&'a self, source: &'a SourceReference) -> QueueFuture<'a, Option<QueueItem>> {
        Box::pin(async move {
            Ok(self
                .load()
                .await?
                .into_iter()
                .find(|item| item.status.is_active() && &item.source == source))
        })
    }

    fn update<'a>(&'a self, item: QueueItem) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut items = self.load().await?;
            let Some(position) = items.iter().position(|existing| existing.id == item.id) else {
                return Err(QueueError::NotFound(item.id));
            };

            if matches!(item.status, QueueStatus::Completed | QueueStatus::Cancelled) {
                items.remove(position);
            } else {
                items[position] = item;
            }
            self.save(&items).await
        })
    }

    fn stats<'a>(&'a self) -> QueueFuture<'a, QueueStats> {
        Box::pin(async move {
            let mut stats = QueueStats::empty(self.name());
            for item in self.load().await? {
                stats.add(item.status, 1);
            }
            Ok(stats)
        })
    }

    fn reset_failed<'a>(&'a self) -> QueueFuture<'a, usize> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut items = self.load().await?;
            let now = crate::timestamp::UtcDateTime::now();
            let mut reset = 0;
            for item in items.iter_mut().filter(|item| item.status == QueueStatus::Failed) {
                item.status = QueueStatus::Pending;
                item.retry_count = 0;
                item.modified_at = now;
                reset += 1;
            }
            if reset > 0 {
                self.save(&items).await?;
            }
            Ok(reset)
        })
    }
}

/// Durable backend when the store has the queue table, cache list otherwise.
pub fn select_backend(store: Option<&Store>, cache: Arc<dyn Cache>) -> Arc<dyn QueueBackend> {
    if let Some(store) = store {
        match store.has_table("pending_receipts") {
            Ok(true) => return Arc::new(StoreQueueBackend::new(store.clone())),
            Ok(false) => {
                tracing::warn!("pending_receipts table missing, offline queue falls back to cache");
            }
            Err(error) => {
                tracing::warn!(%error, "store unavailable, offline queue falls back to cache");
            }
        }
    }
    Arc::new(CacheQueueBackend::new(cache))
}
