//! Transaction cleaner for the dual-write saga.
//!
//! Run on a schedule, the cleaner finds sagas stuck in PENDING past a timeout
//! (the coordinator crashed or lost its log connection mid-saga), resolves
//! each one from its recorded step statuses, and optionally purges rows that
//! compensation soft-deleted.

pub mod cleaner;
pub mod config;
pub mod error;
pub mod resolution;

pub use cleaner::{PurgeReport, RunReport, TablePurge, TransactionCleaner, ZombieReport};
pub use config::{CleanerConfig, Config, LogFormat};
pub use error::{CleanerError, Result};
pub use resolution::Resolution;
