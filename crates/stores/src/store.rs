use async_trait::async_trait;

use crate::{DataRecord, Result, TransactionId};

/// Core trait for the append-only (time-series) store.
///
/// Rows are never updated except for the `is_valid` flag, and never deleted
/// outside of an explicit purge.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Persists tagged rows into `table`.
    ///
    /// Either every row is written or none are. An adapter that declines the
    /// write returns [`StoreError::Rejected`](crate::StoreError::Rejected).
    async fn save(&self, rows: Vec<DataRecord>, classification: &str, table: &str) -> Result<()>;

    /// Soft-deletes every row in `table` written by `transaction_id`.
    ///
    /// Idempotent: calling it again for the same id changes nothing and
    /// returns 0. Returns the number of rows newly marked invalid.
    async fn invalidate_by_transaction_id(
        &self,
        table: &str,
        transaction_id: TransactionId,
    ) -> Result<u64>;

    /// Counts rows in `table` with `is_valid = false`.
    async fn count_invalid(&self, table: &str) -> Result<u64>;

    /// Physically deletes rows in `table` with `is_valid = false`.
    ///
    /// Returns the number of rows removed.
    async fn purge_invalid(&self, table: &str) -> Result<u64>;
}

/// What the relational store guarantees about a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Atomicity {
    /// Writes in a session become visible together on commit, or not at all.
    Scoped,

    /// Writes apply as they are issued; commit and rollback are no-ops.
    BestEffort,
}

impl Atomicity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Atomicity::Scoped => "scoped",
            Atomicity::BestEffort => "best_effort",
        }
    }
}

impl std::fmt::Display for Atomicity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core trait for the relational (business metadata) store.
///
/// The adapter declares its transaction capability once through
/// [`atomicity`](MetadataStore::atomicity); callers decide how to behave at
/// construction time rather than probing per call.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Handle through which business metadata is written.
    type Session: Send;

    /// The transaction guarantee every session from this store carries.
    fn atomicity(&self) -> Atomicity;

    /// Opens a session. Under [`Atomicity::Scoped`] this starts a transaction.
    async fn begin(&self) -> Result<Self::Session>;

    /// Commits the session's writes.
    async fn commit(&self, session: Self::Session) -> Result<()>;

    /// Discards the session's uncommitted writes.
    async fn rollback(&self, session: Self::Session) -> Result<()>;

    /// Marks both halves of `transaction_id` as successful in the transaction
    /// log, as part of `session`.
    ///
    /// Under [`Atomicity::Scoped`] the flags become durable if and only if the
    /// business metadata in the same session commits.
    ///
    /// Fails with [`StoreError::Claimed`](crate::StoreError::Claimed) when the
    /// log row is already terminal or its `pg_status` is no longer PENDING,
    /// which means the cleaner claimed it; the session must then be rolled
    /// back. A missing log row is not an error.
    async fn stamp_commit(
        &self,
        session: &mut Self::Session,
        transaction_id: TransactionId,
    ) -> Result<()>;
}
