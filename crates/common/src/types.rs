use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for one saga attempt.
///
/// Every row written to the append-only store carries the id of the saga
/// that wrote it, which is what makes compensation addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new random transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a transaction ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<TransactionId> for Uuid {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// Resolution state of a saga in the transaction log.
///
/// State transitions:
/// ```text
/// PENDING ──┬──► COMMITTED
///           └──► ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    /// Saga started but has not been resolved yet.
    #[default]
    Pending,

    /// Both stores hold the write (terminal state).
    Committed,

    /// The append-only write was compensated or never happened (terminal state).
    RolledBack,
}

impl FinalStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FinalStatus::Committed | FinalStatus::RolledBack)
    }

    /// Returns true if a saga in this state may move to `next`.
    pub fn can_transition_to(&self, next: FinalStatus) -> bool {
        matches!(self, FinalStatus::Pending) && next.is_terminal()
    }

    /// Returns the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Pending => "PENDING",
            FinalStatus::Committed => "COMMITTED",
            FinalStatus::RolledBack => "ROLLED_BACK",
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FinalStatus::Pending),
            "COMMITTED" => Ok(FinalStatus::Committed),
            "ROLLED_BACK" => Ok(FinalStatus::RolledBack),
            other => Err(ParseStatusError {
                kind: "final status",
                value: other.to_string(),
            }),
        }
    }
}

/// Last observed outcome of one store's half of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Outcome unknown: the step has not reported yet, or the process died.
    #[default]
    Pending,

    /// The write is known to be durable.
    Success,

    /// The write is known to have failed.
    Fail,
}

impl StepStatus {
    /// Returns the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "SUCCESS" => Ok(StepStatus::Success),
            "FAIL" => Ok(StepStatus::Fail),
            other => Err(ParseStatusError {
                kind: "step status",
                value: other.to_string(),
            }),
        }
    }
}

/// The two stores a saga writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    /// Append-only time-series store (market data).
    TimeSeries,

    /// Relational store (business metadata).
    Relational,
}

impl StoreKind {
    /// Name of the transaction log column holding this store's step status.
    pub fn status_column(&self) -> &'static str {
        match self {
            StoreKind::TimeSeries => "td_status",
            StoreKind::Relational => "pg_status",
        }
    }
}
