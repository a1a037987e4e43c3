//! Decision table for zombie transactions.

use stores::{FinalStatus, StepStatus};

/// How a zombie transaction gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Both stores hold the write.
    Commit,

    /// The saga is abandoned. `invalidate` says whether append-only rows
    /// tagged with the transaction id must be soft-deleted first.
    RollBack { invalidate: bool },
}

impl Resolution {
    /// Picks a resolution from the recorded step statuses.
    ///
    /// | td_status | pg_status | resolution |
    /// |---|---|---|
    /// | SUCCESS | SUCCESS | commit |
    /// | SUCCESS | other | invalidate, roll back |
    /// | PENDING | any | invalidate, roll back |
    /// | FAIL | any | roll back |
    ///
    /// `td_status = PENDING` means the process died before the append-only
    /// outcome was recorded, so rows may exist. Invalidating is idempotent
    /// and harmless when they do not.
    pub fn decide(td_status: StepStatus, pg_status: StepStatus) -> Self {
        match (td_status, pg_status) {
            (StepStatus::Success, StepStatus::Success) => Resolution::Commit,
            (StepStatus::Success | StepStatus::Pending, _) => {
                Resolution::RollBack { invalidate: true }
            }
            (StepStatus::Fail, _) => Resolution::RollBack { invalidate: false },
        }
    }

    /// The terminal status this resolution writes.
    pub fn final_status(&self) -> FinalStatus {
        match self {
            Resolution::Commit => FinalStatus::Committed,
            Resolution::RollBack { .. } => FinalStatus::RolledBack,
        }
    }

    /// Returns true if append-only rows must be invalidated.
    pub fn invalidates(&self) -> bool {
        matches!(self, Resolution::RollBack { invalidate: true })
    }
}
