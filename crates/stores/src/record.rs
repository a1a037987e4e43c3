use serde::{Deserialize, Serialize};

use crate::{Result, StoreError, TransactionId};

/// Classification used when the caller does not name one.
pub const DEFAULT_CLASSIFICATION: &str = "market_data";

/// Longest identifier PostgreSQL accepts without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A row in the append-only store.
///
/// `is_valid` is the only field that ever changes after the row is written,
/// and only compensation flips it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// The saga attempt that wrote this row.
    pub transaction_id: TransactionId,

    /// Soft-delete flag. `false` once the owning saga has been rolled back.
    pub is_valid: bool,

    /// Business columns (e.g. one OHLCV bar).
    pub payload: serde_json::Value,
}

impl DataRecord {
    /// Creates a valid record owned by `transaction_id`.
    pub fn new(transaction_id: TransactionId, payload: serde_json::Value) -> Self {
        Self {
            transaction_id,
            is_valid: true,
            payload,
        }
    }
}

/// The untagged rows a caller hands to the saga.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    classification: String,
    rows: Vec<serde_json::Value>,
}

impl Payload {
    /// Creates a payload with the default classification.
    pub fn new(rows: Vec<serde_json::Value>) -> Self {
        Self {
            classification: DEFAULT_CLASSIFICATION.to_string(),
            rows,
        }
    }

    /// Sets the classification passed through to the append-only store.
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = classification.into();
        self
    }

    pub fn classification(&self) -> &str {
        &self.classification
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tags every row with `transaction_id` and `is_valid = true`.
    ///
    /// Returns the classification alongside the tagged rows.
    pub fn tag(self, transaction_id: TransactionId) -> (String, Vec<DataRecord>) {
        let records = self
            .rows
            .into_iter()
            .map(|payload| DataRecord::new(transaction_id, payload))
            .collect();
        (self.classification, records)
    }
}

/// Checks that `table` can be spliced into SQL as a bare identifier.
///
/// Append-only tables are addressed by name at runtime, so the name cannot be
/// bound as a parameter.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && table.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}
