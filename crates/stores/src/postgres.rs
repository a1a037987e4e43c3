use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};
use uuid::Uuid;

use crate::{
    Atomicity, DataRecord, FinalStatus, MetadataStore, Result, StepStatus, StoreError, StoreKind,
    TimeSeriesStore, TransactionId, TransactionLog, TransactionRecord, validate_table_name,
};

/// PostgreSQL-backed append-only store.
///
/// Each market-data table has the shape
/// `(id, transaction_id, classification, is_valid, payload, ingested_at)`;
/// see `migrations/002_create_market_data_tables.sql`.
#[derive(Clone)]
pub struct PostgresTimeSeriesStore {
    pool: PgPool,
}

impl PostgresTimeSeriesStore {
    /// Creates a new PostgreSQL append-only store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TimeSeriesStore for PostgresTimeSeriesStore {
    async fn save(&self, rows: Vec<DataRecord>, classification: &str, table: &str) -> Result<()> {
        validate_table_name(table)?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut valid = Vec::with_capacity(rows.len());
        let mut payloads = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.transaction_id.as_uuid());
            valid.push(row.is_valid);
            payloads.push(Json(row.payload));
        }

        // One statement, so the batch lands all-or-nothing.
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (transaction_id, classification, is_valid, payload)
            SELECT t.transaction_id, $1, t.is_valid, t.payload
            FROM UNNEST($2::uuid[], $3::bool[], $4::jsonb[]) AS t(transaction_id, is_valid, payload)
            "#
        ))
        .bind(classification)
        .bind(ids)
        .bind(valid)
        .bind(payloads)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn invalidate_by_transaction_id(
        &self,
        table: &str,
        transaction_id: TransactionId,
    ) -> Result<u64> {
        validate_table_name(table)?;

        let result = sqlx::query(&format!(
            "UPDATE {table} SET is_valid = FALSE WHERE transaction_id = $1 AND is_valid"
        ))
        .bind(transaction_id.as_uuid())
        .execute(&self.pool)
        .await?;

        tracing::debug!(%table, %transaction_id, rows = result.rows_affected(), "rows invalidated");
        Ok(result.rows_affected())
    }

    async fn count_invalid(&self, table: &str) -> Result<u64> {
        validate_table_name(table)?;

        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE NOT is_valid"))
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn purge_invalid(&self, table: &str) -> Result<u64> {
        validate_table_name(table)?;

        let result = sqlx::query(&format!("DELETE FROM {table} WHERE NOT is_valid"))
            .execute(&self.pool)
            .await?;

        tracing::debug!(%table, rows = result.rows_affected(), "invalid rows purged");
        Ok(result.rows_affected())
    }
}

/// PostgreSQL-backed relational store.
///
/// Sessions are plain `sqlx` transactions; metadata callbacks run their own
/// statements against `&mut **session`.
#[derive(Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Creates a new PostgreSQL metadata store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    type Session = Transaction<'static, Postgres>;

    fn atomicity(&self) -> Atomicity {
        Atomicity::Scoped
    }

    async fn begin(&self) -> Result<Self::Session> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, session: Self::Session) -> Result<()> {
        Ok(session.commit().await?)
    }

    async fn rollback(&self, session: Self::Session) -> Result<()> {
        Ok(session.rollback().await?)
    }

    async fn stamp_commit(
        &self,
        session: &mut Self::Session,
        transaction_id: TransactionId,
    ) -> Result<()> {
        // The row lock taken here is held until the session ends, so a
        // cleaner claim blocks behind it and then sees pg_status = SUCCESS.
        let stamped = sqlx::query(
            r#"
            UPDATE transaction_log
            SET td_status = 'SUCCESS', pg_status = 'SUCCESS', updated_at = NOW()
            WHERE transaction_id = $1 AND final_status = 'PENDING' AND pg_status = 'PENDING'
            "#,
        )
        .bind(transaction_id.as_uuid())
        .execute(&mut **session)
        .await?;

        if stamped.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing stamped: either the saga's log insert failed, or the
        // cleaner claimed the row first.
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM transaction_log WHERE transaction_id = $1 FOR UPDATE"
        ))
        .bind(transaction_id.as_uuid())
        .fetch_optional(&mut **session)
        .await?;

        match row {
            None => Ok(()),
            Some(row) => Err(StoreError::claimed(
                &PostgresTransactionLog::row_to_record(row)?,
            )),
        }
    }
}

const RECORD_COLUMNS: &str = "transaction_id, business_id, table_name, td_status, pg_status, \
     final_status, created_at, updated_at, duration_ms";

/// PostgreSQL-backed transaction log.
#[derive(Clone)]
pub struct PostgresTransactionLog {
    pool: PgPool,
}

impl PostgresTransactionLog {
    /// Creates a new PostgreSQL transaction log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<TransactionRecord> {
        Ok(TransactionRecord {
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            business_id: row.try_get("business_id")?,
            table_name: row.try_get("table_name")?,
            td_status: row.try_get::<String, _>("td_status")?.parse()?,
            pg_status: row.try_get::<String, _>("pg_status")?.parse()?,
            final_status: row.try_get::<String, _>("final_status")?.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }
}

#[async_trait]
impl TransactionLog for PostgresTransactionLog {
    async fn begin(&self, record: &TransactionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_log
                (transaction_id, business_id, table_name, td_status, pg_status, final_status,
                 created_at, updated_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(record.transaction_id.as_uuid())
        .bind(&record.business_id)
        .bind(&record.table_name)
        .bind(record.td_status.as_str())
        .bind(record.pg_status.as_str())
        .bind(record.final_status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        status: StepStatus,
    ) -> Result<()> {
        // status_column() only yields fixed column names.
        sqlx::query(&format!(
            "UPDATE transaction_log SET {} = $2, updated_at = NOW() \
             WHERE transaction_id = $1 AND final_status = 'PENDING'",
            store.status_column()
        ))
        .bind(transaction_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_step(
        &self,
        transaction_id: TransactionId,
        store: StoreKind,
        from: StepStatus,
        to: StepStatus,
    ) -> Result<bool> {
        let column = store.status_column();
        let result = sqlx::query(&format!(
            "UPDATE transaction_log SET {column} = $3, updated_at = NOW() \
             WHERE transaction_id = $1 AND final_status = 'PENDING' AND {column} = $2"
        ))
        .bind(transaction_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve(&self, transaction_id: TransactionId, status: FinalStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: FinalStatus::Pending,
                to: status,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE transaction_log
            SET final_status = $2,
                updated_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - created_at)) * 1000)::BIGINT
            WHERE transaction_id = $1 AND final_status = 'PENDING'
            "#,
        )
        .bind(transaction_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_zombies(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let limit = i64::try_from(limit).map_err(|_| StoreError::LimitOutOfRange(limit))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM transaction_log
            WHERE final_status = 'PENDING' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Option<TransactionRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM transaction_log WHERE transaction_id = $1"
        ))
        .bind(transaction_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}
