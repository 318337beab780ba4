//! # eBarimt Store
//!
//! DuckDB-backed durable storage for the eBarimt integration.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `pending_receipts` | Offline receipt submissions awaiting a drain |
//! | `receipt_log` | Audit trail of every submission outcome |
//! | `districts` | District and branch codes from the tax authority |
//! | `tax_codes` | VAT exempt and zero-rate product codes |
//! | `kv_cache` | TTL key/value entries shared by every process on this store |
//!
//! All user-provided values are passed as query parameters, never interpolated.

pub mod duckdb;
pub mod migrations;
mod queue;
mod receipt_log;
mod reference;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ::duckdb::{Connection, ToSql};
use thiserror::Error;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};
pub use queue::{EnqueueOutcome, PendingReceiptRecord, QueueStatus};
pub use receipt_log::{ReceiptLogRecord, ReceiptLogStats, ReceiptLogStatus};
pub use reference::{DistrictRecord, TaxCodeRecord, UpsertReport};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored row could not be mapped back into its record type.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Configuration for the durable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for eBarimt data.
    pub ebarimt_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let ebarimt_home = resolve_ebarimt_home();
        let db_path = ebarimt_home.join("ebarimt.duckdb");
        Self {
            ebarimt_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl StoreConfig {
    /// Build a configuration rooted at `home`.
    pub fn in_dir(home: impl Into<PathBuf>) -> Self {
        let ebarimt_home = home.into();
        let db_path = ebarimt_home.join("ebarimt.duckdb");
        Self {
            ebarimt_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Durable store shared by the offline queue, receipt log, reference sync and cache.
#[derive(Clone)]
pub struct Store {
    manager: DuckDbConnectionManager,
    enqueue_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open a store with the specified configuration and apply migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let store = Self {
            manager,
            enqueue_lock: Arc::new(Mutex::new(())),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Apply pending schema migrations.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file.
    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Schema versions applied to this database.
    pub fn schema_versions(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.manager.acquire()?;
        Ok(migrations::applied_versions(&connection)?)
    }

    /// Round-trip a trivial query to confirm the database answers.
    pub fn ping(&self) -> Result<(), StoreError> {
        let connection = self.manager.acquire()?;
        let _: i32 = connection.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(())
    }

    /// Check whether a table exists in the main schema.
    pub fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&table];
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
            params,
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Read a non-expired value from the key/value table.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let connection = self.manager.acquire()?;
        let now = epoch_millis();
        let params: [&dyn ToSql; 2] = [&key, &now];
        let mut statement = connection.prepare(
            "SELECT value FROM kv_cache WHERE key = ? AND (expires_at_ms IS NULL OR expires_at_ms > ?)",
        )?;
        let mut rows = statement.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a value. `None` keeps the entry until it is deleted.
    pub fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let connection = self.manager.acquire()?;
        let expires_at_ms = ttl.map(|ttl| epoch_millis().saturating_add(duration_millis(ttl)));
        let params: [&dyn ToSql; 3] = [&key, &value, &expires_at_ms];
        connection.execute(
            "INSERT INTO kv_cache (key, value, expires_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
            params,
        )?;
        Ok(())
    }

    /// Remove a key. Missing keys are not an error.
    pub fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 1] = [&key];
        connection.execute("DELETE FROM kv_cache WHERE key = ?", params)?;
        Ok(())
    }

    /// Delete expired key/value entries and return how many were removed.
    pub fn kv_purge_expired(&self) -> Result<usize, StoreError> {
        let connection = self.manager.acquire()?;
        let now = epoch_millis();
        let params: [&dyn ToSql; 1] = [&now];
        Ok(connection.execute(
            "DELETE FROM kv_cache WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?",
            params,
        )?)
    }

    fn acquire(&self) -> Result<PooledConnection, StoreError> {
        Ok(self.manager.acquire()?)
    }
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn resolve_ebarimt_home() -> PathBuf {
    if let Some(path) = env::var_os("EBARIMT_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ebarimt");
    }

    PathBuf::from(".ebarimt")
}
