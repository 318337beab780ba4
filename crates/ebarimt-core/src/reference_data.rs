//! District and tax code synchronization from the public eBarimt API.

use ebarimt_store::{DistrictRecord, Store, TaxCodeRecord, UpsertReport};
use serde::Serialize;
use serde_json::Value;

use crate::client::ResilientClient;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceSyncReport {
    pub districts: UpsertReport,
    pub tax_codes: UpsertReport,
}

/// Field as text; the API sends codes as numbers or strings.
fn text(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// `branchCode` + `subBranchCode` form the district code.
pub fn district_from_row(row: &Value) -> Option<DistrictRecord> {
    let branch_code = text(row, "branchCode")?;
    let sub_branch_code = text(row, "subBranchCode").unwrap_or_default();
    Some(DistrictRecord {
        code: format!("{branch_code}{sub_branch_code}"),
        branch_name: text(row, "branchName").unwrap_or_default(),
        sub_branch_name: text(row, "subBranchName").unwrap_or_default(),
        branch_code,
        sub_branch_code,
    })
}

/// Rows without `taxProductCode` are skipped.
pub fn tax_code_from_row(row: &Value) -> Option<TaxCodeRecord> {
    Some(TaxCodeRecord {
        code: text(row, "taxProductCode")?,
        name: text(row, "taxProductName").unwrap_or_default(),
        tax_type_code: text(row, "taxTypeCode"),
        tax_type_name: text(row, "taxTypeName"),
        start_date: text(row, "startDate"),
        end_date: text(row, "endDate"),
    })
}

fn durable_store(client: &ResilientClient) -> Result<&Store, SyncError> {
    client.store().ok_or(SyncError::StoreUnavailable)
}

pub async fn sync_districts(client: &ResilientClient) -> Result<UpsertReport, SyncError> {
    let store = durable_store(client)?;
    let rows = client.get_district_codes().await?;
    let districts: Vec<DistrictRecord> = rows.iter().filter_map(district_from_row).collect();
    let report = store.upsert_districts(&districts)?;
    tracing::info!(
        received = rows.len(),
        inserted = report.inserted,
        updated = report.updated,
        "districts synced"
    );
    Ok(report)
}

pub async fn sync_tax_codes(client: &ResilientClient) -> Result<UpsertReport, SyncError> {
    let store = durable_store(client)?;
    let rows = client.get_tax_codes().await?;
    let tax_codes: Vec<TaxCodeRecord> = rows.iter().filter_map(tax_code_from_row).collect();
    let report = store.upsert_tax_codes(&tax_codes)?;
    tracing::info!(
        received = rows.len(),
        inserted = report.inserted,
        updated = report.updated,
        "tax codes synced"
    );
    Ok(report)
}

/// Districts, then tax codes. A failure stops the sync.
pub async fn sync_reference_data(client: &ResilientClient) -> Result<ReferenceSyncReport, SyncError> {
    Ok(ReferenceSyncReport {
        districts: sync_districts(client).await?,
        tax_codes: sync_tax_codes(client).await?,
    })
}
