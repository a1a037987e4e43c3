use common::{FinalStatus, ParseStatusError, StepStatus, TransactionId};
use thiserror::Error;

/// Errors that can occur when interacting with a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted status column held an unknown value.
    #[error("Corrupt transaction log row: {0}")]
    InvalidStatus(#[from] ParseStatusError),

    /// The table name is not a plain SQL identifier.
    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The adapter declined to persist the rows.
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The adapter could not be reached or failed internally.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A status change that the saga state machine forbids.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: FinalStatus, to: FinalStatus },

    /// A scan limit the backend cannot represent.
    #[error("Scan limit out of range: {0}")]
    LimitOutOfRange(usize),

    /// The cleaner claimed the transaction before its commit could be stamped.
    #[error(
        "Transaction {transaction_id} was claimed for resolution \
         (final_status {final_status}, pg_status {pg_status})"
    )]
    Claimed {
        transaction_id: TransactionId,
        final_status: FinalStatus,
        pg_status: StepStatus,
    },
}

impl StoreError {
    pub(crate) fn claimed(record: &crate::TransactionRecord) -> Self {
        StoreError::Claimed {
            transaction_id: record.transaction_id,
            final_status: record.final_status,
            pg_status: record.pg_status,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
