//! Saga failure taxonomy.

use stores::StoreError;
use thiserror::Error;

/// Error type metadata callbacks return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Ways a saga attempt can fail.
///
/// These never reach the caller of
/// [`execute_sync`](crate::SagaCoordinator::execute_sync); they drive
/// compensation, structured logs and the `saga_failures_total` metric.
#[derive(Debug, Error)]
pub enum SagaFailure {
    /// The append-only save failed. Nothing was persisted, nothing to undo.
    #[error("time-series write failed: {0}")]
    TimeSeriesWrite(#[source] StoreError),

    /// The metadata callback failed or panicked, or the relational scope
    /// could not open or commit. Triggers compensation.
    #[error("metadata commit failed: {0}")]
    MetadataCommit(#[source] BoxError),

    /// Invalidating the append-only rows failed. The transaction stays
    /// PENDING for the cleaner.
    #[error("compensation failed: {0}")]
    Compensation(#[source] StoreError),
}

impl SagaFailure {
    /// Wraps anything error-like as a metadata failure.
    pub fn metadata(source: impl Into<BoxError>) -> Self {
        SagaFailure::MetadataCommit(source.into())
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaFailure::TimeSeriesWrite(_) => "time_series_write",
            SagaFailure::MetadataCommit(_) => "metadata_commit",
            SagaFailure::Compensation(_) => "compensation",
        }
    }
}
