//! Shared types for the dual-write saga and its transaction cleaner.

pub mod types;

pub use types::{FinalStatus, ParseStatusError, StepStatus, StoreKind, TransactionId};
