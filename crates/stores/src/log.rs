//! Transaction log: one row per saga attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FinalStatus, Result, StepStatus, StoreKind, TransactionId};

/// A row of the `transaction_log` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,

    /// Caller-supplied correlation key. Not unique across attempts.
    pub business_id: String,

    /// Append-only table the saga wrote to, needed to compensate later.
    pub table_name: String,

    /// Last observed outcome of the append-only write.
    pub td_status: StepStatus,

    /// Last observed outcome of the relational commit.
    pub pg_status: StepStatus,

    pub final_status: FinalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Milliseconds from creation to resolution; `None` while pending.
    pub duration_ms: Option<i64>,
}

impl TransactionRecord {
    /// Creates the PENDING row written when a saga starts.
    pub fn pending(
        transaction_id: TransactionId,
        business_id: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            business_id: business_id.into(),
            table_name: table_name.into(),
            td_status: StepStatus::Pending,
            pg_status: StepStatus::Pending,
            final_status: FinalStatus::Pending,
            created_at: now,
            updated_at: now,
            duration_ms: None,
        }
    }

    /// Overrides the creation time.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Returns the step status recorded for `store`.
    pub fn step_status(&self, store: StoreKind) -> StepStatus {
        match store {
            StoreKind::TimeSeries => self.td_status,
            StoreKind::Relational => self.pg_status,
        }
    }

    /// Returns true once the saga reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        self.final_status.is_terminal()
    }
}

/// Durable record of saga attempts.
///
/// Every mutation other than [`begin`](TransactionLog::begin) only touches
/// rows that are still PENDING, so terminal rows never change.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Inserts a new row. Inserting an id that already exists is a no-op.
    async fn begin(&self, record: &TransactionRecord) -> Result<()>;

    /// Records the outcome of one store's step on a PENDING row.
    async fn record_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        status: StepStatus,
    ) -> Result<()>;

    /// Sets one store's step status from `from` to `to` on a PENDING row.
    ///
    /// Returns false when the row is missing, terminal, or its status is no
    /// longer `from`. The cleaner uses this to claim a row away from a saga
    /// whose relational commit may still be in flight.
    async fn transition_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        from: StepStatus,
        to: StepStatus,
    ) -> Result<bool>;

    /// Moves a PENDING row to `status`, which must be terminal.
    ///
    /// Returns false when the row does not exist or is already terminal.
    async fn resolve(&self, transaction_id: TransactionId, status: FinalStatus) -> Result<bool>;

    /// Loads PENDING rows created before `older_than`, oldest first.
    async fn find_zombies(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>>;

    /// Loads a single row.
    async fn get(&self, transaction_id: TransactionId) -> Result<Option<TransactionRecord>>;
}
