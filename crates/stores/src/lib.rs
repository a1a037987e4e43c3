//! Store adapters used by the dual-write saga.
//!
//! Three seams are defined here:
//! - [`TimeSeriesStore`]: the append-only market-data store, rows tagged with
//!   a transaction id and soft-deleted through `is_valid`.
//! - [`MetadataStore`]: the relational store holding business metadata, with
//!   an explicit [`Atomicity`] capability.
//! - [`TransactionLog`]: the durable record of every saga attempt, kept in the
//!   relational store.
//!
//! Each seam has an in-memory implementation for tests and a PostgreSQL one.

pub mod error;
pub mod log;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{FinalStatus, StepStatus, StoreKind, TransactionId};
pub use error::{Result, StoreError};
pub use log::{TransactionLog, TransactionRecord};
pub use memory::{
    InMemoryMetadataStore, InMemorySession, InMemoryTimeSeriesStore, InMemoryTransactionLog,
};
pub use postgres::{PostgresMetadataStore, PostgresTimeSeriesStore, PostgresTransactionLog};
pub use record::{DEFAULT_CLASSIFICATION, DataRecord, Payload, validate_table_name};
pub use store::{Atomicity, MetadataStore, TimeSeriesStore};
