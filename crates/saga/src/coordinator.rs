//! Saga coordinator for dual writes across the append-only and relational stores.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use stores::{
    Atomicity, FinalStatus, MetadataStore, Payload, StepStatus, StoreKind, TimeSeriesStore,
    TransactionId, TransactionLog, TransactionRecord,
};

use crate::error::{BoxError, SagaFailure};

/// Orchestrates one dual write per call.
///
/// The coordinator drives a 2-step saga (append-only save → relational commit)
/// and compensates the first step when the second fails. Store handles are
/// injected at construction; the relational store's [`Atomicity`] is read
/// once, here, and never checked again.
pub struct SagaCoordinator<T, M, L>
where
    T: TimeSeriesStore,
    M: MetadataStore,
    L: TransactionLog,
{
    time_series: T,
    metadata: M,
    log: L,
    atomicity: Atomicity,
}

impl<T, M, L> SagaCoordinator<T, M, L>
where
    T: TimeSeriesStore,
    M: MetadataStore,
    L: TransactionLog,
{
    /// Creates a new saga coordinator.
    pub fn new(time_series: T, metadata: M, log: L) -> Self {
        let atomicity = metadata.atomicity();
        if atomicity == Atomicity::BestEffort {
            tracing::warn!(
                %atomicity,
                "relational store has no scoped transactions; metadata updates will not be atomic"
            );
        }

        Self {
            time_series,
            metadata,
            log,
            atomicity,
        }
    }

    /// The relational guarantee this coordinator runs under.
    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    /// Writes `payload` to `table` and commits the matching business metadata.
    ///
    /// Returns true only when both stores hold the write and the transaction
    /// log says COMMITTED. Never fails otherwise: every failure is logged,
    /// compensated where needed, and reported as `false`.
    ///
    /// `metadata_update` runs at most once, inside a relational session that
    /// commits when it returns `Ok`.
    #[tracing::instrument(
        skip_all,
        fields(
            business_id = %business_id,
            table = %table,
            rows = payload.len(),
            transaction_id = tracing::field::Empty,
        )
    )]
    pub async fn execute_sync<F>(
        &self,
        business_id: &str,
        payload: Payload,
        table: &str,
        metadata_update: F,
    ) -> bool
    where
        F: for<'s> FnOnce(&'s mut M::Session) -> BoxFuture<'s, Result<(), BoxError>> + Send,
    {
        metrics::counter!("saga_executions_total").increment(1);
        let saga_start = Instant::now();

        let transaction_id = TransactionId::new();
        tracing::Span::current().record("transaction_id", tracing::field::display(transaction_id));
        self.log_start(transaction_id, business_id, table).await;

        // 1. Append-only write
        let (classification, rows) = payload.tag(transaction_id);
        if let Err(source) = self.time_series.save(rows, &classification, table).await {
            let failure = SagaFailure::TimeSeriesWrite(source);
            self.record_step(transaction_id, StoreKind::TimeSeries, StepStatus::Fail)
                .await;
            Self::report_failure(transaction_id, &failure);
            metrics::histogram!("saga_duration_seconds").record(saga_start.elapsed().as_secs_f64());
            return false;
        }
        self.record_step(transaction_id, StoreKind::TimeSeries, StepStatus::Success)
            .await;

        // 2. Relational commit
        let committed = match self.commit_metadata(transaction_id, metadata_update).await {
            Ok(()) => self.confirm_commit(transaction_id).await,
            Err(failure) => {
                Self::report_failure(transaction_id, &failure);
                self.compensate(transaction_id, table).await;
                false
            }
        };

        metrics::histogram!("saga_duration_seconds").record(saga_start.elapsed().as_secs_f64());
        committed
    }

    /// Runs the metadata callback in a relational session and commits it.
    ///
    /// `pg_status = SUCCESS` is stamped inside the same session, so it
    /// commits exactly when the business metadata does.
    async fn commit_metadata<F>(
        &self,
        transaction_id: TransactionId,
        metadata_update: F,
    ) -> Result<(), SagaFailure>
    where
        F: for<'s> FnOnce(&'s mut M::Session) -> BoxFuture<'s, Result<(), BoxError>> + Send,
    {
        if self.atomicity == Atomicity::BestEffort {
            tracing::warn!(
                %transaction_id,
                atomicity = %self.atomicity,
                "running metadata update without atomicity guarantees"
            );
        }

        let mut session = self.metadata.begin().await.map_err(SagaFailure::metadata)?;

        let updated = match AssertUnwindSafe(metadata_update(&mut session))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(SagaFailure::MetadataCommit),
            Err(panic) => Err(SagaFailure::metadata(panic_message(panic.as_ref()))),
        };

        let stamped = match updated {
            Ok(()) => self
                .metadata
                .stamp_commit(&mut session, transaction_id)
                .await
                .map_err(SagaFailure::metadata),
            Err(failure) => Err(failure),
        };

        if let Err(failure) = stamped {
            if let Err(e) = self.metadata.rollback(session).await {
                tracing::warn!(%transaction_id, error = %e, "metadata rollback failed");
            }
            return Err(failure);
        }

        self.metadata
            .commit(session)
            .await
            .map_err(SagaFailure::metadata)
    }

    /// Records COMMITTED after the relational commit.
    ///
    /// Returns false only when the log says the saga ended some other way.
    /// A log that cannot be written is not a failure: the stamped
    /// `pg_status = SUCCESS` lets the cleaner commit the row later.
    async fn confirm_commit(&self, transaction_id: TransactionId) -> bool {
        let conflicting = match self.log.resolve(transaction_id, FinalStatus::Committed).await {
            Ok(true) => None,
            Ok(false) => match self.log.get(transaction_id).await {
                Ok(Some(record)) if record.final_status != FinalStatus::Committed => {
                    Some(record.final_status)
                }
                // Missing row, or the cleaner committed it first.
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(%transaction_id, error = %e, "failed to re-read transaction log");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    %transaction_id,
                    final_status = %FinalStatus::Committed,
                    error = %e,
                    "failed to record final status; the cleaner will resolve it"
                );
                None
            }
        };

        if let Some(final_status) = conflicting {
            metrics::counter!("saga_failures_total", "kind" => "resolution_conflict").increment(1);
            tracing::error!(
                %transaction_id,
                %final_status,
                "relational commit landed on a saga already resolved elsewhere"
            );
            return false;
        }

        metrics::counter!("saga_committed_total").increment(1);
        tracing::info!(
            %transaction_id,
            final_status = %FinalStatus::Committed,
            "saga committed"
        );
        true
    }

    /// Invalidates the append-only rows of a failed saga and marks it ROLLED_BACK.
    ///
    /// A failure here is logged and swallowed; the transaction stays PENDING
    /// with `pg_status = FAIL`, which the cleaner resolves on its next run.
    #[tracing::instrument(skip(self))]
    async fn compensate(&self, transaction_id: TransactionId, table: &str) {
        self.record_step(transaction_id, StoreKind::Relational, StepStatus::Fail)
            .await;

        match self
            .time_series
            .invalidate_by_transaction_id(table, transaction_id)
            .await
        {
            Ok(invalidated) => {
                self.resolve(transaction_id, FinalStatus::RolledBack).await;
                metrics::counter!("saga_rolled_back_total").increment(1);
                tracing::warn!(
                    %transaction_id,
                    invalidated,
                    final_status = %FinalStatus::RolledBack,
                    "saga compensated"
                );
            }
            Err(source) => {
                let failure = SagaFailure::Compensation(source);
                Self::report_failure(transaction_id, &failure);
                tracing::error!(
                    %transaction_id,
                    final_status = %FinalStatus::Pending,
                    "compensation deferred to the transaction cleaner"
                );
            }
        }
    }

    async fn log_start(&self, transaction_id: TransactionId, business_id: &str, table: &str) {
        let record = TransactionRecord::pending(transaction_id, business_id, table);
        match self.log.begin(&record).await {
            Ok(()) => tracing::info!(%transaction_id, %business_id, "saga started"),
            Err(e) => tracing::warn!(
                %transaction_id,
                %business_id,
                error = %e,
                "failed to record saga start; continuing"
            ),
        }
    }

    async fn record_step(&self, transaction_id: TransactionId, store: StoreKind, status: StepStatus) {
        if let Err(e) = self.log.record_step(transaction_id, store, status).await {
            tracing::warn!(
                %transaction_id,
                column = store.status_column(),
                %status,
                error = %e,
                "failed to record step status"
            );
        }
    }

    async fn resolve(&self, transaction_id: TransactionId, status: FinalStatus) {
        match self.log.resolve(transaction_id, status).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                %transaction_id,
                final_status = %status,
                "transaction log row missing or already resolved"
            ),
            Err(e) => tracing::warn!(
                %transaction_id,
                final_status = %status,
                error = %e,
                "failed to record final status; the cleaner will resolve it"
            ),
        }
    }

    fn report_failure(transaction_id: TransactionId, failure: &SagaFailure) {
        metrics::counter!("saga_failures_total", "kind" => failure.kind()).increment(1);
        tracing::warn!(
            %transaction_id,
            failure = failure.kind(),
            error = %failure,
            "saga step failed"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("metadata update panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("metadata update panicked: {message}")
    } else {
        "metadata update panicked".to_string()
    }
}
