use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    Atomicity, DataRecord, FinalStatus, MetadataStore, Result, StepStatus, StoreError, StoreKind,
    TimeSeriesStore, TransactionId, TransactionLog, TransactionRecord, validate_table_name,
};

#[derive(Debug, Clone)]
struct StoredRow {
    classification: String,
    record: DataRecord,
}

#[derive(Debug, Default)]
struct TimeSeriesState {
    tables: HashMap<String, Vec<StoredRow>>,
    fail_on_save: bool,
    fail_on_invalidate: bool,
    invalidate_calls: usize,
    purge_calls: usize,
}

/// In-memory append-only store for testing.
///
/// Counts invalidate and purge calls so tests can assert how often the saga
/// and the cleaner reached for them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTimeSeriesStore {
    state: Arc<RwLock<TimeSeriesState>>,
}

impl InMemoryTimeSeriesStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent save fail.
    pub async fn set_fail_on_save(&self, fail: bool) {
        self.state.write().await.fail_on_save = fail;
    }

    /// Makes every subsequent invalidate fail.
    pub async fn set_fail_on_invalidate(&self, fail: bool) {
        self.state.write().await.fail_on_invalidate = fail;
    }

    /// Returns every row in `table`, valid or not.
    pub async fn records(&self, table: &str) -> Vec<DataRecord> {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|row| row.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the rows in `table` written by `transaction_id`.
    pub async fn records_for(&self, table: &str, transaction_id: TransactionId) -> Vec<DataRecord> {
        self.records(table)
            .await
            .into_iter()
            .filter(|record| record.transaction_id == transaction_id)
            .collect()
    }

    /// Returns the classification each row of `table` was saved under.
    pub async fn classifications(&self, table: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|row| row.classification.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of invalidate calls received, including failed ones.
    pub async fn invalidate_calls(&self) -> usize {
        self.state.read().await.invalidate_calls
    }

    /// Number of purge (physical delete) calls received.
    pub async fn purge_calls(&self) -> usize {
        self.state.read().await.purge_calls
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn save(&self, rows: Vec<DataRecord>, classification: &str, table: &str) -> Result<()> {
        validate_table_name(table)?;

        let mut state = self.state.write().await;
        if state.fail_on_save {
            return Err(StoreError::Unavailable(format!(
                "injected save failure on {table}"
            )));
        }

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.into_iter().map(|record| StoredRow {
                classification: classification.to_string(),
                record,
            }));
        Ok(())
    }

    async fn invalidate_by_transaction_id(
        &self,
        table: &str,
        transaction_id: TransactionId,
    ) -> Result<u64> {
        validate_table_name(table)?;

        let mut state = self.state.write().await;
        state.invalidate_calls += 1;
        if state.fail_on_invalidate {
            return Err(StoreError::Unavailable(format!(
                "injected invalidate failure on {table}"
            )));
        }

        let mut invalidated = 0;
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows
                .iter_mut()
                .filter(|row| row.record.transaction_id == transaction_id && row.record.is_valid)
            {
                row.record.is_valid = false;
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }

    async fn count_invalid(&self, table: &str) -> Result<u64> {
        validate_table_name(table)?;

        let state = self.state.read().await;
        let count = state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| !row.record.is_valid).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn purge_invalid(&self, table: &str) -> Result<u64> {
        validate_table_name(table)?;

        let mut state = self.state.write().await;
        state.purge_calls += 1;

        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| row.record.is_valid);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: HashMap<TransactionId, TransactionRecord>,
    fail_on_write: bool,
    fail_on_scan: bool,
}

/// In-memory transaction log for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionLog {
    state: Arc<RwLock<LogState>>,
}

impl InMemoryTransactionLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `begin`, `record_step` and `resolve` fail.
    pub async fn set_fail_on_write(&self, fail: bool) {
        self.state.write().await.fail_on_write = fail;
    }

    /// Makes `find_zombies` fail.
    pub async fn set_fail_on_scan(&self, fail: bool) {
        self.state.write().await.fail_on_scan = fail;
    }

    /// Returns the number of rows in the log.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Returns every row whose business id matches.
    pub async fn records_for_business(&self, business_id: &str) -> Vec<TransactionRecord> {
        self.state
            .read()
            .await
            .records
            .values()
            .filter(|record| record.business_id == business_id)
            .cloned()
            .collect()
    }

    /// Sets both step statuses to SUCCESS on a row nobody has claimed.
    ///
    /// Called from a committing metadata session, so it ignores
    /// `fail_on_write`, which models the log being unreachable on its own.
    async fn stamp_success(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_unclaimed(&state, transaction_id)?;

        if let Some(record) = state.records.get_mut(&transaction_id) {
            record.td_status = StepStatus::Success;
            record.pg_status = StepStatus::Success;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn ensure_unclaimed(&self, transaction_id: TransactionId) -> Result<()> {
        Self::check_unclaimed(&*self.state.read().await, transaction_id)
    }

    fn check_unclaimed(state: &LogState, transaction_id: TransactionId) -> Result<()> {
        match state.records.get(&transaction_id) {
            Some(record) if record.is_resolved() || record.pg_status != StepStatus::Pending => {
                Err(StoreError::claimed(record))
            }
            _ => Ok(()),
        }
    }

    fn check_writable(state: &LogState) -> Result<()> {
        if state.fail_on_write {
            return Err(StoreError::Unavailable(
                "injected transaction log failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn begin(&self, record: &TransactionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_writable(&state)?;
        state
            .records
            .entry(record.transaction_id)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn record_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        status: StepStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_writable(&state)?;

        if let Some(record) = state.records.get_mut(&transaction_id)
            && !record.is_resolved()
        {
            match store {
                StoreKind::TimeSeries => record.td_status = status,
                StoreKind::Relational => record.pg_status = status,
            }
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        from: StepStatus,
        to: StepStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::check_writable(&state)?;

        let Some(record) = state.records.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if record.is_resolved() || record.step_status(store) != from {
            return Ok(false);
        }
        match store {
            StoreKind::TimeSeries => record.td_status = to,
            StoreKind::Relational => record.pg_status = to,
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn resolve(&self, transaction_id: TransactionId, status: FinalStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: FinalStatus::Pending,
                to: status,
            });
        }

        let mut state = self.state.write().await;
        Self::check_writable(&state)?;

        let Some(record) = state.records.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if !record.final_status.can_transition_to(status) {
            return Ok(false);
        }

        let now = Utc::now();
        record.final_status = status;
        record.updated_at = now;
        record.duration_ms = Some((now - record.created_at).num_milliseconds());
        Ok(true)
    }

    async fn find_zombies(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let state = self.state.read().await;
        if state.fail_on_scan {
            return Err(StoreError::Unavailable(
                "injected transaction log scan failure".to_string(),
            ));
        }

        let mut zombies: Vec<_> = state
            .records
            .values()
            .filter(|record| {
                record.final_status == FinalStatus::Pending && record.created_at < older_than
            })
            .cloned()
            .collect();
        zombies.sort_by_key(|record| record.created_at);
        zombies.truncate(limit);
        Ok(zombies)
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Option<TransactionRecord>> {
        Ok(self.state.read().await.records.get(&transaction_id).cloned())
    }
}

type Tables = HashMap<String, BTreeMap<String, serde_json::Value>>;

#[derive(Debug, Default)]
struct MetadataState {
    tables: Tables,
    fail_on_begin: bool,
    fail_on_commit: bool,
    commits: usize,
    rollbacks: usize,
}

#[derive(Debug, Clone)]
enum SessionWrite {
    Upsert {
        table: String,
        key: String,
        value: serde_json::Value,
    },
    Delete {
        table: String,
        key: String,
    },
    Stamp(TransactionId),
}

/// In-memory relational store for testing.
///
/// Business metadata is modelled as keyed JSON values per table. The store
/// shares its [`InMemoryTransactionLog`] so that `stamp_commit` lands in the
/// same log the saga and the cleaner read.
#[derive(Debug, Clone)]
pub struct InMemoryMetadataStore {
    state: Arc<RwLock<MetadataState>>,
    log: InMemoryTransactionLog,
    atomicity: Atomicity,
}

impl InMemoryMetadataStore {
    /// Creates a store whose sessions are transactional.
    pub fn new(log: InMemoryTransactionLog) -> Self {
        Self::with_atomicity(log, Atomicity::Scoped)
    }

    /// Creates a store without transaction support: writes apply immediately.
    pub fn best_effort(log: InMemoryTransactionLog) -> Self {
        Self::with_atomicity(log, Atomicity::BestEffort)
    }

    fn with_atomicity(log: InMemoryTransactionLog, atomicity: Atomicity) -> Self {
        Self {
            state: Arc::new(RwLock::new(MetadataState::default())),
            log,
            atomicity,
        }
    }

    /// Reads a committed value.
    pub async fn get(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// Number of committed rows in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Makes every subsequent `begin` fail.
    pub async fn set_fail_on_begin(&self, fail: bool) {
        self.state.write().await.fail_on_begin = fail;
    }

    /// Makes every subsequent `commit` fail, discarding the session.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        self.state.write().await.fail_on_commit = fail;
    }

    pub async fn commit_count(&self) -> usize {
        self.state.read().await.commits
    }

    pub async fn rollback_count(&self) -> usize {
        self.state.read().await.rollbacks
    }

    async fn apply(&self, write: SessionWrite) -> Result<()> {
        match write {
            SessionWrite::Upsert { table, key, value } => {
                self.state
                    .write()
                    .await
                    .tables
                    .entry(table)
                    .or_default()
                    .insert(key, value);
            }
            SessionWrite::Delete { table, key } => {
                if let Some(rows) = self.state.write().await.tables.get_mut(&table) {
                    rows.remove(&key);
                }
            }
            SessionWrite::Stamp(transaction_id) => self.log.stamp_success(transaction_id).await?,
        }
        Ok(())
    }
}

/// A unit of work against [`InMemoryMetadataStore`].
///
/// Under [`Atomicity::Scoped`] writes are buffered until commit; under
/// [`Atomicity::BestEffort`] they apply as they are issued.
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryMetadataStore,
    pending: Vec<SessionWrite>,
}

impl InMemorySession {
    /// Inserts or replaces `key` in `table`.
    pub async fn upsert(
        &mut self,
        table: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        self.write(SessionWrite::Upsert {
            table: table.to_string(),
            key: key.into(),
            value,
        })
        .await
    }

    /// Removes `key` from `table`.
    pub async fn delete(&mut self, table: &str, key: impl Into<String>) -> Result<()> {
        self.write(SessionWrite::Delete {
            table: table.to_string(),
            key: key.into(),
        })
        .await
    }

    async fn write(&mut self, write: SessionWrite) -> Result<()> {
        match self.store.atomicity {
            Atomicity::Scoped => self.pending.push(write),
            Atomicity::BestEffort => self.store.apply(write).await?,
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    type Session = InMemorySession;

    fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    async fn begin(&self) -> Result<InMemorySession> {
        if self.state.read().await.fail_on_begin {
            return Err(StoreError::Unavailable("injected begin failure".to_string()));
        }
        Ok(InMemorySession {
            store: self.clone(),
            pending: Vec::new(),
        })
    }

    async fn commit(&self, session: InMemorySession) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.fail_on_commit {
                state.rollbacks += 1;
                return Err(StoreError::Unavailable(
                    "injected commit failure".to_string(),
                ));
            }
        }

        // The stamp decides the commit: if the cleaner claimed the row in the
        // meantime, none of the session's writes land.
        let (stamps, writes): (Vec<_>, Vec<_>) = session
            .pending
            .into_iter()
            .partition(|write| matches!(write, SessionWrite::Stamp(_)));
        for stamp in stamps {
            if let Err(e) = self.apply(stamp).await {
                self.state.write().await.rollbacks += 1;
                return Err(e);
            }
        }

        self.state.write().await.commits += 1;
        for write in writes {
            self.apply(write).await?;
        }
        Ok(())
    }

    async fn rollback(&self, session: InMemorySession) -> Result<()> {
        drop(session);
        self.state.write().await.rollbacks += 1;
        Ok(())
    }

    async fn stamp_commit(
        &self,
        session: &mut InMemorySession,
        transaction_id: TransactionId,
    ) -> Result<()> {
        self.log.ensure_unclaimed(transaction_id).await?;
        session.write(SessionWrite::Stamp(transaction_id)).await
    }
}
