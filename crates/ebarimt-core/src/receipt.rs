use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::offline_queue::SourceReference;

/// Receipt type accepted by the POS API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillType {
    #[default]
    #[serde(rename = "B2C_RECEIPT")]
    B2cReceipt,
    #[serde(rename = "B2B_RECEIPT")]
    B2bReceipt,
}

impl BillType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::B2cReceipt => "B2C_RECEIPT",
            Self::B2bReceipt => "B2B_RECEIPT",
        }
    }
}

impl Display for BillType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "B2C_RECEIPT" | "B2C" => Ok(Self::B2cReceipt),
            "B2B_RECEIPT" | "B2B" => Ok(Self::B2bReceipt),
            other => Err(format!("unknown bill type '{other}'")),
        }
    }
}

/// Body of a successful `POST /receipt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bill_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lottery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReceiptResponse {
    /// `billId`, or `id` when the terminal only returns that.
    pub fn receipt_id(&self) -> Option<&str> {
        self.bill_id.as_deref().or(self.id.as_deref())
    }

    /// The POS API reports rejections with HTTP 200 and `status: ERROR`.
    pub fn is_rejected(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("error"))
    }
}

/// One receipt to submit for a source document version.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptSubmission {
    pub source: SourceReference,
    /// Source document modification stamp; part of the idempotency key.
    pub modified: String,
    pub payload: Value,
    pub bill_type: BillType,
    pub priority: Option<i32>,
    /// Receipt amount, for logging.
    pub amount: Option<f64>,
}

impl ReceiptSubmission {
    pub fn new(source: SourceReference, modified: impl Into<String>, payload: Value) -> Self {
        let bill_type = payload
            .get("billType")
            .and_then(Value::as_str)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        let amount = payload.get("totalAmount").and_then(Value::as_f64);
        Self {
            source,
            modified: modified.into(),
            payload,
            bill_type,
            priority: None,
            amount,
        }
    }

    pub fn with_bill_type(mut self, bill_type: BillType) -> Self {
        self.bill_type = bill_type;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What happened to a submitted receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Accepted by the POS API now.
    Submitted(ReceiptResponse),
    /// This document version was already submitted; the earlier result is returned.
    Duplicate(ReceiptResponse),
    /// The API was unreachable; the receipt waits in the offline queue.
    Queued { queue_id: String, message: String },
}

impl SubmissionOutcome {
    pub fn receipt(&self) -> Option<&ReceiptResponse> {
        match self {
            Self::Submitted(receipt) | Self::Duplicate(receipt) => Some(receipt),
            Self::Queued { .. } => None,
        }
    }

    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}
