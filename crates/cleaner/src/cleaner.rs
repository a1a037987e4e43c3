//! Zombie reconciliation and purge of soft-deleted rows.

use chrono::Utc;
use stores::{
    FinalStatus, StepStatus, StoreKind, TimeSeriesStore, TransactionId, TransactionLog,
    TransactionRecord,
};

use crate::config::CleanerConfig;
use crate::error::{CleanerError, Result};
use crate::resolution::Resolution;

/// Outcome of one zombie scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZombieReport {
    /// PENDING rows returned by the scan.
    pub scanned: usize,
    pub committed: usize,
    pub rolled_back: usize,

    /// Rows already resolved by someone else, or counted only (dry run).
    pub skipped: usize,

    /// Rows whose reconciliation failed; retried on the next run.
    pub failed: usize,
}

/// Invalid row counts for one append-only table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePurge {
    pub table: String,
    pub invalid_rows: u64,
    pub deleted_rows: u64,
}

/// Outcome of one purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub tables: Vec<TablePurge>,
}

impl PurgeReport {
    /// Total rows physically deleted.
    pub fn deleted_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted_rows).sum()
    }
}

/// Outcome of [`TransactionCleaner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub zombies: ZombieReport,

    /// `None` unless the purge pass was requested.
    pub purge: Option<PurgeReport>,
}

/// Resolves sagas stuck in PENDING and purges soft-deleted rows.
///
/// Overlapping cleaner runs must be prevented by the scheduler. A single run
/// is safe to repeat because every resolution only touches rows that are
/// still PENDING and invalidation is idempotent. Sagas still in flight are
/// fenced off through the `pg_status` claim in [`process_zombie`](Self::process_zombie).
pub struct TransactionCleaner<T, L>
where
    T: TimeSeriesStore,
    L: TransactionLog,
{
    time_series: T,
    log: L,
    config: CleanerConfig,
}

impl<T, L> TransactionCleaner<T, L>
where
    T: TimeSeriesStore,
    L: TransactionLog,
{
    /// Creates a new cleaner.
    pub fn new(time_series: T, log: L, config: CleanerConfig) -> Self {
        Self {
            time_series,
            log,
            config,
        }
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Reconciles zombies, then purges invalid rows when `purge` is set.
    #[tracing::instrument(skip(self), fields(dry_run = self.config.dry_run))]
    pub async fn run(&self, purge: bool) -> Result<RunReport> {
        let zombies = self.check_zombie_transactions().await?;
        let purge = if purge {
            Some(self.cleanup_invalid_data().await?)
        } else {
            None
        };

        tracing::info!(
            scanned = zombies.scanned,
            committed = zombies.committed,
            rolled_back = zombies.rolled_back,
            skipped = zombies.skipped,
            failed = zombies.failed,
            purged = purge.as_ref().map(PurgeReport::deleted_rows).unwrap_or(0),
            "cleaner run finished"
        );

        Ok(RunReport { zombies, purge })
    }

    /// Loads the oldest PENDING rows past the zombie timeout and resolves each.
    ///
    /// Fails only when the scan itself fails. A failure on one transaction is
    /// logged, counted, and left for the next run.
    #[tracing::instrument(skip(self))]
    pub async fn check_zombie_transactions(&self) -> Result<ZombieReport> {
        let cutoff = Utc::now() - self.config.zombie_timeout();
        let zombies = self
            .log
            .find_zombies(cutoff, self.config.batch_limit)
            .await?;

        metrics::counter!("cleaner_zombies_scanned_total").increment(zombies.len() as u64);
        tracing::debug!(count = zombies.len(), %cutoff, "zombie scan complete");

        let mut report = ZombieReport {
            scanned: zombies.len(),
            ..ZombieReport::default()
        };

        for zombie in &zombies {
            match self.process_zombie(zombie).await {
                Ok(Some(resolution)) if !self.config.dry_run => {
                    match resolution.final_status() {
                        FinalStatus::Committed => report.committed += 1,
                        _ => report.rolled_back += 1,
                    }
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    metrics::counter!("cleaner_zombie_failures_total").increment(1);
                    tracing::error!(
                        transaction_id = %zombie.transaction_id,
                        business_id = %zombie.business_id,
                        error = %e,
                        "failed to reconcile zombie transaction"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Resolves one zombie from its recorded step statuses.
    ///
    /// The row is re-read first, so a transaction resolved since the scan
    /// (or by an earlier call) is left untouched and `None` is returned.
    /// Before rows are invalidated while the relational outcome is still
    /// unknown, the row is claimed by moving `pg_status` from PENDING to FAIL;
    /// a saga still committing then fails its stamp and rolls back instead.
    /// In dry-run mode the resolution is computed and logged but not applied.
    #[tracing::instrument(
        skip_all,
        fields(
            transaction_id = %zombie.transaction_id,
            business_id = %zombie.business_id,
        )
    )]
    pub async fn process_zombie(&self, zombie: &TransactionRecord) -> Result<Option<Resolution>> {
        let transaction_id = zombie.transaction_id;
        let Some(mut current) = self.reload(transaction_id).await? else {
            return Ok(None);
        };

        let mut resolution = Resolution::decide(current.td_status, current.pg_status);

        if resolution.invalidates()
            && current.pg_status == StepStatus::Pending
            && !self.config.dry_run
        {
            let claimed = self
                .log
                .transition_step(
                    transaction_id,
                    StoreKind::Relational,
                    StepStatus::Pending,
                    StepStatus::Fail,
                )
                .await
                .map_err(CleanerError::reconcile(transaction_id))?;

            if claimed {
                current.pg_status = StepStatus::Fail;
            } else {
                // The saga stamped or failed its commit after our read.
                let Some(latest) = self.reload(transaction_id).await? else {
                    return Ok(None);
                };
                current = latest;
                resolution = Resolution::decide(current.td_status, current.pg_status);
            }
        }
        let final_status = resolution.final_status();

        if self.config.dry_run {
            tracing::info!(
                td_status = %current.td_status,
                pg_status = %current.pg_status,
                %final_status,
                invalidate = resolution.invalidates(),
                "dry run: would resolve zombie"
            );
            return Ok(Some(resolution));
        }

        if resolution.invalidates() {
            let invalidated = self
                .time_series
                .invalidate_by_transaction_id(&current.table_name, transaction_id)
                .await
                .map_err(CleanerError::reconcile(transaction_id))?;
            tracing::debug!(table = %current.table_name, invalidated, "rows invalidated");
        }

        if !self.update_txn_status(transaction_id, final_status).await? {
            return Ok(None);
        }

        metrics::counter!(
            "cleaner_zombies_resolved_total",
            "final_status" => final_status.as_str()
        )
        .increment(1);
        tracing::info!(
            td_status = %current.td_status,
            pg_status = %current.pg_status,
            %final_status,
            "zombie resolved"
        );

        Ok(Some(resolution))
    }

    /// Counts invalid rows in every configured table and deletes them.
    ///
    /// Tables without invalid rows are not touched. In dry-run mode only
    /// the counts are reported.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_invalid_data(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();

        for table in &self.config.tables {
            let invalid_rows = self.time_series.count_invalid(table).await?;
            let deleted_rows = if invalid_rows > 0 && !self.config.dry_run {
                self.time_series.purge_invalid(table).await?
            } else {
                0
            };

            metrics::counter!("cleaner_rows_purged_total").increment(deleted_rows);
            tracing::info!(%table, invalid_rows, deleted_rows, "purge pass");

            report.tables.push(TablePurge {
                table: table.clone(),
                invalid_rows,
                deleted_rows,
            });
        }

        Ok(report)
    }

    /// Re-reads a zombie. `None` when it is gone or already terminal.
    async fn reload(&self, transaction_id: TransactionId) -> Result<Option<TransactionRecord>> {
        let current = self
            .log
            .get(transaction_id)
            .await
            .map_err(CleanerError::reconcile(transaction_id))?;

        match current {
            None => {
                tracing::warn!("zombie disappeared from the transaction log");
                Ok(None)
            }
            Some(record) if record.is_resolved() => {
                tracing::debug!(final_status = %record.final_status, "already resolved");
                Ok(None)
            }
            Some(record) => Ok(Some(record)),
        }
    }

    /// Writes the terminal status. Returns false if another writer got there first.
    async fn update_txn_status(
        &self,
        transaction_id: TransactionId,
        status: FinalStatus,
    ) -> Result<bool> {
        let updated = self
            .log
            .resolve(transaction_id, status)
            .await
            .map_err(CleanerError::reconcile(transaction_id))?;

        if !updated {
            tracing::debug!(%transaction_id, "transaction resolved concurrently");
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use stores::{DataRecord, InMemoryTimeSeriesStore, InMemoryTransactionLog};

    use super::*;

    const TABLE: &str = "minute_kline";

    fn cleaner(
        time_series: &InMemoryTimeSeriesStore,
        log: &InMemoryTransactionLog,
        config: CleanerConfig,
    ) -> TransactionCleaner<InMemoryTimeSeriesStore, InMemoryTransactionLog> {
        TransactionCleaner::new(time_series.clone(), log.clone(), config)
    }

    /// Seeds a PENDING row created `age_minutes` ago with the given step
    /// statuses, and `rows` valid append-only rows tagged with its id.
    async fn seed(
        time_series: &InMemoryTimeSeriesStore,
        log: &InMemoryTransactionLog,
        age_minutes: i64,
        td: StepStatus,
        pg: StepStatus,
        rows: usize,
    ) -> TransactionId {
        let id = TransactionId::new();
        let record = TransactionRecord::pending(id, "600000.SH_DAILY_20240101", TABLE)
            .created_at(Utc::now() - Duration::minutes(age_minutes));
        log.begin(&record).await.unwrap();
        log.record_step(id, StoreKind::TimeSeries, td).await.unwrap();
        log.record_step(id, StoreKind::Relational, pg).await.unwrap();

        if rows > 0 {
            let rows = (0..rows)
                .map(|i| DataRecord::new(id, json!({ "minute": i })))
                .collect();
            time_series.save(rows, "kline", TABLE).await.unwrap();
        }
        id
    }

    async fn final_status(log: &InMemoryTransactionLog, id: TransactionId) -> FinalStatus {
        log.get(id).await.unwrap().unwrap().final_status
    }

    #[tokio::test]
    async fn resolves_zombies_per_decision_table() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let committed = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Success, 2).await;
        let orphaned = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 2).await;
        let crashed = seed(&ts, &log, 30, StepStatus::Pending, StepStatus::Pending, 2).await;
        let never_written = seed(&ts, &log, 30, StepStatus::Fail, StepStatus::Pending, 0).await;

        let report = cleaner(&ts, &log, CleanerConfig::default())
            .check_zombie_transactions()
            .await
            .unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.committed, 1);
        assert_eq!(report.rolled_back, 3);
        assert_eq!(report.failed, 0);

        assert_eq!(final_status(&log, committed).await, FinalStatus::Committed);
        assert!(ts.records_for(TABLE, committed).await.iter().all(|r| r.is_valid));

        for id in [orphaned, crashed, never_written] {
            assert_eq!(final_status(&log, id).await, FinalStatus::RolledBack);
        }
        assert!(ts.records_for(TABLE, orphaned).await.iter().all(|r| !r.is_valid));
        assert!(ts.records_for(TABLE, crashed).await.iter().all(|r| !r.is_valid));

        // td FAIL skips the invalidate call
        assert_eq!(ts.invalidate_calls().await, 2);
    }

    #[tokio::test]
    async fn second_process_zombie_is_a_no_op() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let id = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 3).await;
        let zombie = log.get(id).await.unwrap().unwrap();
        let cleaner = cleaner(&ts, &log, CleanerConfig::default());

        let first = cleaner.process_zombie(&zombie).await.unwrap();
        assert_eq!(first, Some(Resolution::RollBack { invalidate: true }));
        assert_eq!(ts.invalidate_calls().await, 1);
        assert_eq!(final_status(&log, id).await, FinalStatus::RolledBack);

        // Same stale snapshot, as a second overlapping scan would hold.
        let second = cleaner.process_zombie(&zombie).await.unwrap();
        assert_eq!(second, None);
        assert_eq!(ts.invalidate_calls().await, 1);
        assert_eq!(final_status(&log, id).await, FinalStatus::RolledBack);
    }

    #[tokio::test]
    async fn unknown_commit_outcome_is_claimed_before_invalidating() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let id = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Pending, 2).await;
        let zombie = log.get(id).await.unwrap().unwrap();

        let resolution = cleaner(&ts, &log, CleanerConfig::default())
            .process_zombie(&zombie)
            .await
            .unwrap();

        assert_eq!(resolution, Some(Resolution::RollBack { invalidate: true }));
        let record = log.get(id).await.unwrap().unwrap();
        assert_eq!(record.pg_status, StepStatus::Fail);
        assert_eq!(record.final_status, FinalStatus::RolledBack);
        assert!(ts.records_for(TABLE, id).await.iter().all(|r| !r.is_valid));
    }

    #[tokio::test]
    async fn claim_failure_leaves_rows_untouched() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let id = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Pending, 2).await;
        let zombie = log.get(id).await.unwrap().unwrap();
        log.set_fail_on_write(true).await;

        let result = cleaner(&ts, &log, CleanerConfig::default())
            .process_zombie(&zombie)
            .await;

        assert!(matches!(result, Err(CleanerError::ZombieReconciliation { .. })));
        assert_eq!(ts.invalidate_calls().await, 0);
        assert!(ts.records_for(TABLE, id).await.iter().all(|r| r.is_valid));
    }

    #[tokio::test]
    async fn fresh_transactions_are_not_zombies() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let fresh = seed(&ts, &log, 2, StepStatus::Success, StepStatus::Pending, 1).await;

        let report = cleaner(&ts, &log, CleanerConfig::default())
            .check_zombie_transactions()
            .await
            .unwrap();

        assert_eq!(report, ZombieReport::default());
        assert_eq!(final_status(&log, fresh).await, FinalStatus::Pending);
        assert_eq!(ts.invalidate_calls().await, 0);
    }

    #[tokio::test]
    async fn batch_limit_bounds_one_run_and_later_runs_converge() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let oldest = seed(&ts, &log, 50, StepStatus::Fail, StepStatus::Pending, 0).await;
        let middle = seed(&ts, &log, 40, StepStatus::Fail, StepStatus::Pending, 0).await;
        let newest = seed(&ts, &log, 30, StepStatus::Fail, StepStatus::Pending, 0).await;

        let cleaner = cleaner(
            &ts,
            &log,
            CleanerConfig {
                batch_limit: 2,
                ..CleanerConfig::default()
            },
        );

        let first = cleaner.check_zombie_transactions().await.unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(final_status(&log, oldest).await, FinalStatus::RolledBack);
        assert_eq!(final_status(&log, middle).await, FinalStatus::RolledBack);
        assert_eq!(final_status(&log, newest).await, FinalStatus::Pending);

        let second = cleaner.check_zombie_transactions().await.unwrap();
        assert_eq!(second.scanned, 1);
        assert_eq!(final_status(&log, newest).await, FinalStatus::RolledBack);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let id = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 3).await;
        let earlier = seed(&ts, &log, 2, StepStatus::Success, StepStatus::Fail, 2).await;
        ts.invalidate_by_transaction_id(TABLE, earlier).await.unwrap();

        let config = CleanerConfig {
            dry_run: true,
            ..CleanerConfig::default()
        };
        let report = cleaner(&ts, &log, config).run(true).await.unwrap();

        assert_eq!(report.zombies.scanned, 1);
        assert_eq!(report.zombies.skipped, 1);
        assert_eq!(report.zombies.rolled_back, 0);
        assert_eq!(final_status(&log, id).await, FinalStatus::Pending);
        assert!(ts.records_for(TABLE, id).await.iter().all(|r| r.is_valid));

        let purge = report.purge.unwrap();
        assert_eq!(purge.tables[0].invalid_rows, 2);
        assert_eq!(purge.deleted_rows(), 0);
        assert_eq!(ts.purge_calls().await, 0);
        assert_eq!(ts.count_invalid(TABLE).await.unwrap(), 2);
        // only the setup call above
        assert_eq!(ts.invalidate_calls().await, 1);
    }

    #[tokio::test]
    async fn run_without_purge_issues_no_deletes() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 5).await;

        let report = cleaner(&ts, &log, CleanerConfig::default())
            .run(false)
            .await
            .unwrap();

        assert_eq!(report.zombies.rolled_back, 1);
        assert!(report.purge.is_none());
        assert_eq!(ts.count_invalid(TABLE).await.unwrap(), 5);
        assert_eq!(ts.purge_calls().await, 0);
    }

    #[tokio::test]
    async fn purge_deletes_invalid_rows_in_configured_tables() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 4).await;
        seed(&ts, &log, 30, StepStatus::Success, StepStatus::Success, 2).await;

        let report = cleaner(&ts, &log, CleanerConfig::default())
            .run(true)
            .await
            .unwrap();

        let purge = report.purge.unwrap();
        assert_eq!(
            purge.tables,
            vec![
                TablePurge {
                    table: "minute_kline".to_string(),
                    invalid_rows: 4,
                    deleted_rows: 4,
                },
                TablePurge {
                    table: "daily_kline".to_string(),
                    invalid_rows: 0,
                    deleted_rows: 0,
                },
            ]
        );
        // daily_kline had nothing to delete
        assert_eq!(ts.purge_calls().await, 1);
        assert_eq!(ts.records(TABLE).await.len(), 2);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_the_batch() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();

        let malformed = TransactionId::new();
        log.begin(
            &TransactionRecord::pending(malformed, "broken", "kline; DROP TABLE x")
                .created_at(Utc::now() - Duration::minutes(60)),
        )
        .await
        .unwrap();
        let healthy = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 1).await;

        let report = cleaner(&ts, &log, CleanerConfig::default())
            .check_zombie_transactions()
            .await
            .unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(final_status(&log, malformed).await, FinalStatus::Pending);
        assert_eq!(final_status(&log, healthy).await, FinalStatus::RolledBack);
    }

    #[tokio::test]
    async fn invalidate_failure_leaves_transaction_pending() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        let id = seed(&ts, &log, 30, StepStatus::Success, StepStatus::Fail, 2).await;
        ts.set_fail_on_invalidate(true).await;

        let zombie = log.get(id).await.unwrap().unwrap();
        let err = cleaner(&ts, &log, CleanerConfig::default())
            .process_zombie(&zombie)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CleanerError::ZombieReconciliation { transaction_id, .. } if transaction_id == id
        ));
        assert_eq!(final_status(&log, id).await, FinalStatus::Pending);
    }

    #[tokio::test]
    async fn scan_failure_is_an_error() {
        let ts = InMemoryTimeSeriesStore::new();
        let log = InMemoryTransactionLog::new();
        log.set_fail_on_scan(true).await;

        let result = cleaner(&ts, &log, CleanerConfig::default()).run(true).await;

        assert!(matches!(result, Err(CleanerError::Store(_))));
        assert_eq!(ts.purge_calls().await, 0);
    }
}
