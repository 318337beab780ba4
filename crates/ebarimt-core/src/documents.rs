//! Write-back of receipt identifiers to the originating business document.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::middleware::BoxFuture;
use crate::offline_queue::SourceReference;
use crate::receipt::ReceiptResponse;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document {0} not found")]
    NotFound(SourceReference),

    #[error("document update rejected: {0}")]
    Rejected(String),
}

/// Receipt fields stamped onto a source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentReceiptFields {
    pub bill_id: Option<String>,
    pub lottery: Option<String>,
    pub qr_data: Option<String>,
}

impl From<&ReceiptResponse> for DocumentReceiptFields {
    fn from(receipt: &ReceiptResponse) -> Self {
        Self {
            bill_id: receipt.receipt_id().map(str::to_owned),
            lottery: receipt.lottery.clone(),
            qr_data: receipt.qr_data.clone(),
        }
    }
}

/// The host application's document API, as far as receipts need it.
pub trait DocumentStore: Send + Sync {
    fn apply_receipt<'a>(
        &'a self,
        source: &'a SourceReference,
        receipt: &'a ReceiptResponse,
    ) -> BoxFuture<'a, Result<(), DocumentError>>;
}

/// In-process document store for the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<Mutex<HashMap<SourceReference, DocumentReceiptFields>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipt_for(&self, source: &SourceReference) -> Option<DocumentReceiptFields> {
        self.documents
            .lock()
            .expect("document store lock is not poisoned")
            .get(source)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .expect("document store lock is not poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn apply_receipt<'a>(
        &'a self,
        source: &'a SourceReference,
        receipt: &'a ReceiptResponse,
    ) -> BoxFuture<'a, Result<(), DocumentError>> {
        self.documents
            .lock()
            .expect("document store lock is not poisoned")
            .insert(source.clone(), DocumentReceiptFields::from(receipt));
        Box::pin(async { Ok(()) })
    }
}
