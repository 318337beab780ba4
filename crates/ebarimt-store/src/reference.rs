use ::duckdb::ToSql;
use serde::Serialize;

use crate::{finalize_transaction, Store, StoreError};

/// A district/branch code published by the tax authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistrictRecord {
    /// Branch code followed by sub-branch code.
    pub code: String,
    pub branch_code: String,
    pub branch_name: String,
    pub sub_branch_code: String,
    pub sub_branch_name: String,
}

/// A VAT exempt or zero-rate product code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxCodeRecord {
    pub code: String,
    pub name: String,
    pub tax_type_code: Option<String>,
    pub tax_type_name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Rows inserted versus refreshed by an upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
}

impl Store {
    pub fn upsert_districts(&self, rows: &[DistrictRecord]) -> Result<UpsertReport, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertReport::default());
        }

        let connection = self.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<UpsertReport, StoreError> {
            let mut report = UpsertReport::default();
            for row in rows {
                let key: [&dyn ToSql; 1] = [&row.code];
                let exists: i64 = connection.query_row(
                    "SELECT COUNT(*) FROM districts WHERE code = ?",
                    key,
                    |r| r.get(0),
                )?;

                let params: [&dyn ToSql; 5] = [
                    &row.code,
                    &row.branch_code,
                    &row.branch_name,
                    &row.sub_branch_code,
                    &row.sub_branch_name,
                ];
                connection.execute(
                    "INSERT INTO districts (code, branch_code, branch_name, sub_branch_code, sub_branch_name) \
                     VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT (code) DO UPDATE SET branch_code = excluded.branch_code, \
                     branch_name = excluded.branch_name, sub_branch_code = excluded.sub_branch_code, \
                     sub_branch_name = excluded.sub_branch_name, updated_at = CURRENT_TIMESTAMP",
                    params,
                )?;

                if exists == 0 {
                    report.inserted += 1;
                } else {
                    report.updated += 1;
                }
            }
            Ok(report)
        })();
        finalize_transaction(&connection, result)
    }

    pub fn upsert_tax_codes(&self, rows: &[TaxCodeRecord]) -> Result<UpsertReport, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertReport::default());
        }

        let connection = self.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<UpsertReport, StoreError> {
            let mut report = UpsertReport::default();
            for row in rows {
                let key: [&dyn ToSql; 1] = [&row.code];
                let exists: i64 = connection.query_row(
                    "SELECT COUNT(*) FROM tax_codes WHERE code = ?",
                    key,
                    |r| r.get(0),
                )?;

                let params: [&dyn ToSql; 6] = [
                    &row.code,
                    &row.name,
                    &row.tax_type_code,
                    &row.tax_type_name,
                    &row.start_date,
                    &row.end_date,
                ];
                connection.execute(
                    "INSERT INTO tax_codes (code, name, tax_type_code, tax_type_name, start_date, end_date) \
                     VALUES (?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (code) DO UPDATE SET name = excluded.name, \
                     tax_type_code = excluded.tax_type_code, tax_type_name = excluded.tax_type_name, \
                     start_date = excluded.start_date, end_date = excluded.end_date, \
                     updated_at = CURRENT_TIMESTAMP",
                    params,
                )?;

                if exists == 0 {
                    report.inserted += 1;
                } else {
                    report.updated += 1;
                }
            }
            Ok(report)
        })();
        finalize_transaction(&connection, result)
    }

    pub fn district_count(&self) -> Result<u64, StoreError> {
        self.count_rows("SELECT COUNT(*) FROM districts")
    }

    pub fn tax_code_count(&self) -> Result<u64, StoreError> {
        self.count_rows("SELECT COUNT(*) FROM tax_codes")
    }

    fn count_rows(&self, sql: &str) -> Result<u64, StoreError> {
        let connection = self.acquire()?;
        let count: i64 = connection.query_row(sql, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use tempfile::tempdir;

    fn district(code: &str, name: &str) -> DistrictRecord {
        DistrictRecord {
            code: code.to_string(),
            branch_code: code[..2].to_string(),
            branch_name: "Улаанбаатар".to_string(),
            sub_branch_code: code[2..].to_string(),
            sub_branch_name: name.to_string(),
        }
    }

    #[test]
    fn upsert_counts_new_and_refreshed_rows() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        let first = store
            .upsert_districts(&[district("2501", "Баянгол"), district("2502", "Баянзүрх")])
            .expect("upsert");
        assert_eq!(first, UpsertReport { inserted: 2, updated: 0 });

        let second = store
            .upsert_districts(&[district("2501", "Баянгол дүүрэг"), district("2503", "Сүхбаатар")])
            .expect("upsert");
        assert_eq!(second, UpsertReport { inserted: 1, updated: 1 });
        assert_eq!(store.district_count().expect("count"), 3);
    }

    #[test]
    fn tax_codes_accept_open_ended_validity() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(StoreConfig::in_dir(temp.path())).expect("store");

        let report = store
            .upsert_tax_codes(&[TaxCodeRecord {
                code: "305".to_string(),
                name: "Exempt goods".to_string(),
                tax_type_code: Some("VAT_FREE".to_string()),
                tax_type_name: None,
                start_date: Some("2020-01-01".to_string()),
                end_date: None,
            }])
            .expect("upsert");
        assert_eq!(report.inserted, 1);
        assert_eq!(store.tax_code_count().expect("count"), 1);
    }
}
