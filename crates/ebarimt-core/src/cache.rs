//! Shared key/value cache with TTL.
//!
//! Circuit breaker state, idempotency records, tokens, metrics and the
//! fallback offline queue all live behind [`Cache`]. [`MemoryCache`] is
//! process-local; [`StoreCache`] persists to the `DuckDB` store so state
//! survives restarts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ebarimt_store::Store;
use serde_json::Value;

use crate::error::CacheError;

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Async key/value store with optional per-entry TTL.
pub trait Cache: Send + Sync {
    /// Backend name reported in stats and health output.
    fn name(&self) -> &'static str;

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Value>>;

    /// `ttl = None` keeps the entry until it is deleted or overwritten.
    fn set<'a>(&'a self, key: &'a str, value: Value, ttl: Option<Duration>)
        -> CacheFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;

    /// Drop expired entries and return how many were removed.
    fn purge_expired(&self) -> CacheFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Thread-safe in-memory cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<tokio::sync::RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries and return how many were dropped.
    pub async fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.is_live(now));
        before - map.len()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Number of entries, including expired ones not yet cleared.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Cache for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Value>> {
        Box::pin(async move {
            let map = self.inner.read().await;
            Ok(map
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .map(|entry| entry.value.clone()))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            self.inner
                .write()
                .await
                .insert(key.to_owned(), CacheEntry { value, expires_at });
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.inner.write().await.remove(key);
            Ok(())
        })
    }

    fn purge_expired(&self) -> CacheFuture<'_, usize> {
        Box::pin(async move { Ok(self.clear_expired().await) })
    }
}

/// Cache persisted in the store's `kv_cache` table.
#[derive(Clone)]
pub struct StoreCache {
    store: Store,
}

impl StoreCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Cache for StoreCache {
    fn name(&self) -> &'static str {
        "store"
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Value>> {
        Box::pin(async move {
            match self.store.kv_get(key)? {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.store.kv_set(key, &value.to_string(), ttl)?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.store.kv_delete(key)?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> CacheFuture<'_, usize> {
        Box::pin(async move { Ok(self.store.kv_purge_expired()?) })
    }
}
