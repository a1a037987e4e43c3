//! Saga pattern implementation for dual writes.
//!
//! One logical write spans two stores with no shared transaction:
//! 1. Save rows, tagged with a fresh transaction id, to the append-only store
//! 2. Commit business metadata in the relational store
//!
//! If step 2 fails, step 1 is compensated by invalidating every row carrying
//! the transaction id. Every attempt is recorded in the transaction log so
//! that attempts interrupted by a crash can be resolved later by the cleaner.

pub mod coordinator;
pub mod error;

pub use coordinator::SagaCoordinator;
pub use error::{BoxError, SagaFailure};
