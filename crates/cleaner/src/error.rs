//! Cleaner error types.

use stores::{StoreError, TransactionId};
use thiserror::Error;

/// Errors that can occur while reconciling or purging.
#[derive(Debug, Error)]
pub enum CleanerError {
    /// A store call outside per-transaction reconciliation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Reconciling one zombie failed. Logged per transaction; the batch goes on.
    #[error("Failed to reconcile transaction {transaction_id}: {source}")]
    ZombieReconciliation {
        transaction_id: TransactionId,
        #[source]
        source: StoreError,
    },

    /// The metrics exporter could not be installed.
    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// The configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CleanerError {
    pub(crate) fn reconcile(transaction_id: TransactionId) -> impl FnOnce(StoreError) -> Self {
        move |source| CleanerError::ZombieReconciliation {
            transaction_id,
            source,
        }
    }
}

/// Result type for cleaner operations.
pub type Result<T> = std::result::Result<T, CleanerError>;
