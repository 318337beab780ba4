use std::fmt::{Display, Formatter};
use std::str::FromStr;

use ::duckdb::{Row, ToSql};
use serde::{Deserialize, Serialize};

use crate::{finalize_transaction, Store, StoreError};

/// Lifecycle of a queued receipt submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Pending and Processing items still block a second enqueue for the same source.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::InvalidData(format!(
                "unknown queue status '{other}'"
            ))),
        }
    }
}

/// A row of the `pending_receipts` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingReceiptRecord {
    pub id: String,
    pub source_doctype: String,
    pub source_name: String,
    /// Receipt payload as serialized JSON.
    pub payload: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub priority: i32,
    pub created_at: String,
    pub modified_at: String,
    /// Version stamp of the source document the payload was built from.
    pub document_modified: Option<String>,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted.
    Created(String),
    /// An active row already existed for the same source document.
    Existing(String),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, source_doctype, source_name, payload, status, retry_count, \
     last_error, priority, created_at, modified_at, document_modified FROM pending_receipts";

impl Store {
    /// Insert a pending receipt unless an active one exists for the same source.
    ///
    /// The check and insert run in one transaction under a process-wide lock, so
    /// concurrent callers in this process cannot both insert. `DuckDB` admits a
    /// single writing process per file.
    ///
    /// # Panics
    /// Panics if the enqueue mutex is poisoned.
    pub fn enqueue_receipt(
        &self,
        record: &PendingReceiptRecord,
    ) -> Result<EnqueueOutcome, StoreError> {
        let _guard = self
            .enqueue_lock
            .lock()
            .expect("enqueue lock is not poisoned");
        let connection = self.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<EnqueueOutcome, StoreError> {
            let existing: Option<String> = {
                let lookup: [&dyn ToSql; 2] = [&record.source_doctype, &record.source_name];
                let mut statement = connection.prepare(
                    "SELECT id FROM pending_receipts WHERE source_doctype = ? AND source_name = ? \
                     AND status IN ('Pending', 'Processing') ORDER BY seq LIMIT 1",
                )?;
                let mut rows = statement.query(lookup)?;
                match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };
            if let Some(id) = existing {
                return Ok(EnqueueOutcome::Existing(id));
            }

            let retry_count = i64::from(record.retry_count);
            let params: [&dyn ToSql; 11] = [
                &record.id,
                &record.source_doctype,
                &record.source_name,
                &record.payload,
                &record.status.as_str(),
                &retry_count,
                &record.last_error,
                &record.priority,
                &record.created_at,
                &record.modified_at,
                &record.document_modified,
            ];
            connection.execute(
                "INSERT INTO pending_receipts (id, source_doctype, source_name, payload, status, \
                 retry_count, last_error, priority, created_at, modified_at, document_modified) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params,
            )?;
            Ok(EnqueueOutcome::Created(record.id.clone()))
        })();
        finalize_transaction(&connection, result)
    }

    /// Pending rows below the retry ceiling, highest priority (lowest number) first,
    /// then oldest first.
    pub fn pending_receipts(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<PendingReceiptRecord>, StoreError> {
        let connection = self.acquire()?;
        let max_retries = i64::from(max_retries);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let params: [&dyn ToSql; 2] = [&max_retries, &limit];
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'Pending' AND retry_count < ? \
             ORDER BY priority ASC, seq ASC LIMIT ?"
        );
        let mut statement = connection.prepare(sql.as_str())?;
        let rows = statement.query_map(params, map_record)?;
        collect_records(rows)
    }

    /// The Pending or Processing row of a source document, if any.
    pub fn active_receipt_for(
        &self,
        source_doctype: &str,
        source_name: &str,
    ) -> Result<Option<PendingReceiptRecord>, StoreError> {
        let connection = self.acquire()?;
        let params: [&dyn ToSql; 2] = [&source_doctype, &source_name];
        let sql = format!(
            "{SELECT_COLUMNS} WHERE source_doctype = ? AND source_name = ? \
             AND status IN ('Pending', 'Processing') ORDER BY seq LIMIT 1"
        );
        let mut statement = connection.prepare(sql.as_str())?;
        let mut rows = statement.query_map(params, map_record)?;
        match rows.next() {
            Some(row) => Ok(Some(into_record(row?)?)),
            None => Ok(None),
        }
    }

    pub fn get_receipt(&self, id: &str) -> Result<Option<PendingReceiptRecord>, StoreError> {
        let connection = self.acquire()?;
        let params: [&dyn ToSql; 1] = [&id];
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let mut statement = connection.prepare(sql.as_str())?;
        let mut rows = statement.query_map(params, map_record)?;
        match rows.next() {
            Some(row) => Ok(Some(into_record(row?)?)),
            None => Ok(None),
        }
    }

    /// Persist the mutable columns of an existing row. Returns false when the id is unknown.
    pub fn update_receipt(&self, record: &PendingReceiptRecord) -> Result<bool, StoreError> {
        let connection = self.acquire()?;
        let retry_count = i64::from(record.retry_count);
        let params: [&dyn ToSql; 8] = [
            &record.payload,
            &record.status.as_str(),
            &retry_count,
            &record.last_error,
            &record.priority,
            &record.modified_at,
            &record.document_modified,
            &record.id,
        ];
        let changed = connection.execute(
            "UPDATE pending_receipts SET payload = ?, status = ?, retry_count = ?, last_error = ?, \
             priority = ?, modified_at = ?, document_modified = ? WHERE id = ?",
            params,
        )?;
        Ok(changed > 0)
    }

    /// Return every Failed row to Pending with its retry counter cleared.
    pub fn reset_failed_receipts(&self, modified_at: &str) -> Result<usize, StoreError> {
        let connection = self.acquire()?;
        let params: [&dyn ToSql; 1] = [&modified_at];
        Ok(connection.execute(
            "UPDATE pending_receipts SET status = 'Pending', retry_count = 0, modified_at = ? \
             WHERE status = 'Failed'",
            params,
        )?)
    }

    /// Row counts grouped by status.
    pub fn receipt_status_counts(&self) -> Result<Vec<(QueueStatus, u64)>, StoreError> {
        let connection = self.acquire()?;
        let mut statement = connection
            .prepare("SELECT status, COUNT(*) FROM pending_receipts GROUP BY status ORDER BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            counts.push((status.parse()?, u64::try_from(count).unwrap_or(0)));
        }
        Ok(counts)
    }
}

type RawRecord = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    i32,
    String,
    String,
    Option<String>,
);

fn map_record(row: &Row<'_>) -> Result<RawRecord, ::duckdb::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn into_record(raw: RawRecord) -> Result<PendingReceiptRecord, StoreError> {
    let (
        id,
        source_doctype,
        source_name,
        payload,
        status,
        retry_count,
        last_error,
        priority,
        created_at,
        modified_at,
        document_modified,
    ) = raw;
    Ok(PendingReceiptRecord {
        id,
        source_doctype,
        source_name,
        payload,
        status: status.parse()?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StoreError::InvalidData(format!("retry_count {retry_count} out of range")))?,
        last_error,
        priority,
        created_at,
        modified_at,
        document_modified,
    })
}

fn collect_records(
    rows: impl Iterator<Item = Result<RawRecord, ::duckdb::Error>>,
) -> Result<Vec<PendingReceiptRecord>, StoreError> {
    let mut records = Vec::new();
    for row in rows {
        records.push(into_record(row?)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use tempfile::tempdir;

    fn record(id: &str, name: &str, priority: i32) -> PendingReceiptRecord {
        PendingReceiptRecord {
            id: id.to_string(),
            source_doctype: "Sales Invoice".to_string(),
            source_name: name.to_string(),
            payload: "{\"amount\":1000}".to_string(),
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            priority,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            modified_at: "2026-01-01T00:00:00Z".to_string(),
            document_modified: Some("2026-01-01 09:00:00".to_string()),
        }
    }

    #[test]
    fn second_enqueue_for_active_source_returns_existing_id() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        let first = store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let second = store.enqueue_receipt(&record("q-2", "INV-1", 5)).expect("enqueue");

        assert_eq!(first, EnqueueOutcome::Created("q-1".to_string()));
        assert_eq!(second, EnqueueOutcome::Existing("q-1".to_string()));
        assert_eq!(store.pending_receipts(10, 5).expect("pending").len(), 1);
    }

    #[test]
    fn completed_source_can_be_enqueued_again() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let mut done = store.get_receipt("q-1").expect("get").expect("row");
        done.status = QueueStatus::Completed;
        assert!(store.update_receipt(&done).expect("update"));

        let again = store.enqueue_receipt(&record("q-2", "INV-1", 5)).expect("enqueue");
        assert_eq!(again, EnqueueOutcome::Created("q-2".to_string()));
    }

    #[test]
    fn active_row_lookup_ignores_finished_rows() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let active = store
            .active_receipt_for("Sales Invoice", "INV-1")
            .expect("lookup")
            .expect("active row");
        assert_eq!(active.id, "q-1");
        assert_eq!(active.document_modified.as_deref(), Some("2026-01-01 09:00:00"));

        let mut done = active;
        done.status = QueueStatus::Completed;
        store.update_receipt(&done).expect("update");
        assert!(store
            .active_receipt_for("Sales Invoice", "INV-1")
            .expect("lookup")
            .is_none());
        assert!(store
            .active_receipt_for("Sales Invoice", "INV-2")
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn update_replaces_payload_and_document_version() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let mut row = store.get_receipt("q-1").expect("get").expect("row");
        row.payload = "{\"amount\":2000}".to_string();
        row.document_modified = Some("2026-01-01 10:00:00".to_string());
        store.update_receipt(&row).expect("update");

        let row = store.get_receipt("q-1").expect("get").expect("row");
        assert_eq!(row.payload, "{\"amount\":2000}");
        assert_eq!(row.document_modified.as_deref(), Some("2026-01-01 10:00:00"));
    }

    #[test]
    fn pending_rows_are_ordered_by_priority_then_insertion() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("low-a", "INV-1", 9)).expect("enqueue");
        store.enqueue_receipt(&record("high", "INV-2", 1)).expect("enqueue");
        store.enqueue_receipt(&record("low-b", "INV-3", 9)).expect("enqueue");

        let ids: Vec<String> = store
            .pending_receipts(10, 5)
            .expect("pending")
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(ids, vec!["high", "low-a", "low-b"]);
    }

    #[test]
    fn rows_at_retry_ceiling_are_not_pending() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let mut row = store.get_receipt("q-1").expect("get").expect("row");
        row.retry_count = 5;
        store.update_receipt(&row).expect("update");

        assert!(store.pending_receipts(10, 5).expect("pending").is_empty());
    }

    #[test]
    fn reset_failed_returns_rows_to_pending() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        store.enqueue_receipt(&record("q-1", "INV-1", 5)).expect("enqueue");
        let mut row = store.get_receipt("q-1").expect("get").expect("row");
        row.status = QueueStatus::Failed;
        row.retry_count = 5;
        row.last_error = Some("HTTP 503".to_string());
        store.update_receipt(&row).expect("update");

        assert_eq!(store.reset_failed_receipts("2026-01-02T00:00:00Z").expect("reset"), 1);
        let row = store.get_receipt("q-1").expect("get").expect("row");
        assert_eq!(row.status, QueueStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert_eq!(
            store.receipt_status_counts().expect("counts"),
            vec![(QueueStatus::Pending, 1)]
        );
    }
}
