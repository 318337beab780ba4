use std::str::FromStr;

use ::duckdb::ToSql;
use serde::Serialize;

use crate::{Store, StoreError};

/// Outcome recorded for one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReceiptLogStatus {
    Success,
    Queued,
    Failed,
}

impl ReceiptLogStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Queued => "Queued",
            Self::Failed => "Failed",
        }
    }
}

impl FromStr for ReceiptLogStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Success" => Ok(Self::Success),
            "Queued" => Ok(Self::Queued),
            "Failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidData(format!(
                "unknown receipt log status '{other}'"
            ))),
        }
    }
}

/// A row of the `receipt_log` table. `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptLogRecord {
    pub id: Option<i64>,
    pub source_doctype: String,
    pub source_name: String,
    pub status: ReceiptLogStatus,
    pub bill_type: Option<String>,
    pub receipt_id: Option<String>,
    pub lottery: Option<String>,
    pub qr_data: Option<String>,
    pub queue_id: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub created_at: String,
}

/// Aggregate counts over the receipt log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptLogStats {
    pub total: u64,
    pub success: u64,
    pub queued: u64,
    pub failed: u64,
    /// Percentage of successful submissions, rounded to two decimals.
    pub success_rate: f64,
}

impl Store {
    pub fn append_receipt_log(&self, record: &ReceiptLogRecord) -> Result<i64, StoreError> {
        let connection = self.acquire()?;
        let duration_ms = record
            .duration_ms
            .map(|value| i64::try_from(value).unwrap_or(i64::MAX));
        let params: [&dyn ToSql; 11] = [
            &record.source_doctype,
            &record.source_name,
            &record.status.as_str(),
            &record.bill_type,
            &record.receipt_id,
            &record.lottery,
            &record.qr_data,
            &record.queue_id,
            &record.error,
            &duration_ms,
            &record.created_at,
        ];
        let id: i64 = connection.query_row(
            "INSERT INTO receipt_log (source_doctype, source_name, status, bill_type, receipt_id, \
             lottery, qr_data, queue_id, error, duration_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            params,
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Most recent entries first.
    pub fn recent_receipt_log(&self, limit: usize) -> Result<Vec<ReceiptLogRecord>, StoreError> {
        let connection = self.acquire()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let params: [&dyn ToSql; 1] = [&limit];
        let mut statement = connection.prepare(
            "SELECT id, source_doctype, source_name, status, bill_type, receipt_id, lottery, \
             qr_data, queue_id, error, duration_ms, created_at \
             FROM receipt_log ORDER BY id DESC LIMIT ?",
        )?;
        let rows = statement.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<i64>>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                id,
                source_doctype,
                source_name,
                status,
                bill_type,
                receipt_id,
                lottery,
                qr_data,
                queue_id,
                error,
                duration_ms,
                created_at,
            ) = row?;
            records.push(ReceiptLogRecord {
                id: Some(id),
                source_doctype,
                source_name,
                status: status.parse()?,
                bill_type,
                receipt_id,
                lottery,
                qr_data,
                queue_id,
                error,
                duration_ms: duration_ms.and_then(|value| u64::try_from(value).ok()),
                created_at,
            });
        }
        Ok(records)
    }

    /// Delete entries in `status` created before `created_before` and return
    /// how many were removed. Timestamps are RFC3339 UTC, so text order is
    /// time order.
    pub fn prune_receipt_log(
        &self,
        status: ReceiptLogStatus,
        created_before: &str,
    ) -> Result<usize, StoreError> {
        let connection = self.acquire()?;
        let params: [&dyn ToSql; 2] = [&status.as_str(), &created_before];
        Ok(connection.execute(
            "DELETE FROM receipt_log WHERE status = ? AND created_at < ?",
            params,
        )?)
    }

    pub fn receipt_log_stats(&self) -> Result<ReceiptLogStats, StoreError> {
        let connection = self.acquire()?;
        let (total, success, queued, failed): (i64, i64, i64, i64) = connection.query_row(
            "SELECT COUNT(*), \
             COUNT(*) FILTER (WHERE status = 'Success'), \
             COUNT(*) FILTER (WHERE status = 'Queued'), \
             COUNT(*) FILTER (WHERE status = 'Failed') \
             FROM receipt_log",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let success_rate = if total > 0 {
            ((success as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(ReceiptLogStats {
            total: u64::try_from(total).unwrap_or(0),
            success: u64::try_from(success).unwrap_or(0),
            queued: u64::try_from(queued).unwrap_or(0),
            failed: u64::try_from(failed).unwrap_or(0),
            success_rate,
        })
    }
}
