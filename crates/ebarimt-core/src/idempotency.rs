//! Cache-backed deduplication of logical operations.
//!
//! A key is the operation name plus a short hash of the canonicalized
//! parameters, so parameter order never changes the key. Receipt keys include
//! the source document's modification stamp: an amended invoice gets a fresh
//! key while an unchanged resubmission is answered from the cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::error::CacheError;
use crate::timestamp::UtcDateTime;

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);
const RECEIPT_TTL: Duration = Duration::from_secs(720 * 3600);
const LOTTERY_TTL: Duration = Duration::from_secs(365 * 86_400);
const KEY_HASH_LEN: usize = 16;

/// Cached outcome of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub result: Value,
    pub timestamp: UtcDateTime,
    pub app: String,
}

#[derive(Clone)]
pub struct IdempotencyManager {
    cache: Arc<dyn Cache>,
    app: String,
    default_ttl: Duration,
    receipt_ttl: Duration,
}

impl IdempotencyManager {
    pub fn new(cache: Arc<dyn Cache>, app: impl Into<String>) -> Self {
        Self {
            cache,
            app: app.into(),
            default_ttl: DEFAULT_TTL,
            receipt_ttl: RECEIPT_TTL,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_receipt_ttl(mut self, ttl: Duration) -> Self {
        self.receipt_ttl = ttl;
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub const fn receipt_ttl(&self) -> Duration {
        self.receipt_ttl
    }

    /// `idempotency:{app}:{operation}:{hash}` where `hash` is the first 16 hex
    /// characters of the SHA-256 of `operation:{canonical params}`.
    pub fn generate_key(&self, operation: &str, params: &Value) -> String {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);
        let digest = Sha256::digest(format!("{operation}:{canonical}").as_bytes());
        let hash = hex::encode(digest);
        format!(
            "idempotency:{}:{operation}:{}",
            self.app,
            &hash[..KEY_HASH_LEN]
        )
    }

    pub async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>, CacheError> {
        match self.cache.get(key).await? {
            Some(value) => match serde_json::from_value::<IdempotencyRecord>(value) {
                Ok(record) => Ok(Some(record)),
                Err(error) => {
                    tracing::warn!(key, %error, "ignoring unreadable idempotency record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn store(&self, key: &str, result: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let record = IdempotencyRecord {
            result,
            timestamp: UtcDateTime::now(),
            app: self.app.clone(),
        };
        self.cache
            .set(key, serde_json::to_value(record)?, Some(ttl.unwrap_or(self.default_ttl)))
            .await
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.cache.delete(key).await
    }

    /// Run `func` unless an earlier result for the same operation and
    /// parameters is cached. Returns the result and whether it was a duplicate.
    ///
    /// Check and store are separate cache calls; two concurrent first calls
    /// may both execute.
    pub async fn get_or_execute<T, E, F, Fut>(
        &self,
        operation: &str,
        params: &Value,
        ttl: Option<Duration>,
        func: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.generate_key(operation, params);
        self.get_or_execute_with_key(&key, ttl, func).await
    }

    /// [`Self::get_or_execute`] with a precomputed key.
    ///
    /// Cache failures degrade to executing `func`; errors from `func` are
    /// returned and never cached.
    pub async fn get_or_execute_with_key<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        func: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.check(key).await {
            Ok(Some(record)) => match serde_json::from_value::<T>(record.result) {
                Ok(result) => {
                    tracing::info!(key, original = %record.timestamp, "idempotency hit");
                    return Ok((result, true));
                }
                Err(error) => {
                    tracing::warn!(key, %error, "cached result has an unexpected shape, executing again");
                }
            },
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(key, %error, "idempotency check failed, executing without deduplication");
            }
        }

        let result = func().await?;

        match serde_json::to_value(&result) {
            Ok(value) => {
                if let Err(error) = self.store(key, value, ttl).await {
                    tracing::warn!(key, %error, "failed to store idempotency record");
                }
            }
            Err(error) => tracing::warn!(key, %error, "result is not serializable, not cached"),
        }

        Ok((result, false))
    }

    /// Key for submitting a receipt for one version of a source document.
    pub fn receipt_key(&self, doctype: &str, docname: &str, modified: &str) -> String {
        self.generate_key(
            "create_receipt",
            &json!({ "doctype": doctype, "docname": docname, "modified": modified }),
        )
    }

    pub async fn check_receipt_submission(
        &self,
        doctype: &str,
        docname: &str,
        modified: &str,
    ) -> Result<Option<IdempotencyRecord>, CacheError> {
        self.check(&self.receipt_key(doctype, docname, modified)).await
    }

    pub async fn store_receipt_result(
        &self,
        doctype: &str,
        docname: &str,
        modified: &str,
        result: Value,
    ) -> Result<(), CacheError> {
        let key = self.receipt_key(doctype, docname, modified);
        self.store(&key, result, Some(self.receipt_ttl)).await
    }

    /// Drop the cached receipt for an amended document version.
    pub async fn invalidate_receipt(
        &self,
        doctype: &str,
        docname: &str,
        modified: &str,
    ) -> Result<(), CacheError> {
        self.invalidate(&self.receipt_key(doctype, docname, modified))
            .await
    }

    pub async fn check_lottery_claimed(&self, lottery_number: &str) -> Result<bool, CacheError> {
        Ok(self.cache.get(&lottery_key(lottery_number)).await?.is_some())
    }

    pub async fn mark_lottery_claimed(
        &self,
        lottery_number: &str,
        invoice: &str,
    ) -> Result<(), CacheError> {
        let value = json!({ "invoice": invoice, "timestamp": UtcDateTime::now() });
        self.cache
            .set(&lottery_key(lottery_number), value, Some(LOTTERY_TTL))
            .await
    }
}

impl std::fmt::Debug for IdempotencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyManager")
            .field("app", &self.app)
            .field("cache", &self.cache.name())
            .field("default_ttl", &self.default_ttl)
            .field("receipt_ttl", &self.receipt_ttl)
            .finish()
    }
}

fn lottery_key(lottery_number: &str) -> String {
    format!("ebarimt:lottery:{lottery_number}")
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
