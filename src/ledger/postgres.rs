//! PostgreSQL ledger backend.
//!
//! Records live in `campus_job_execution_records` (see `migrations/`). The
//! partial unique index `idx_job_exec_completed_unique` on
//! `(tenant_id, job_key) WHERE status = 'completed'` is what makes completion
//! unique across processes; a violation surfaces as
//! [`LedgerError::AlreadyCompleted`].

use super::{
    apply_update, check_transition, ExecutionLedger, JobExecutionRecord, JobFilter, JobStatus,
    LedgerError, LedgerResult, NewJobExecution, StatusUpdate,
};
use crate::config::DatabaseSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, tenant_id, job_key, job_type, status, attempt, max_attempts, \
    started_at, completed_at, error_message, result_summary, actor_user_id, request_id, \
    broker_job_id, created_at, updated_at";

#[derive(Debug, FromRow)]
struct JobExecutionRow {
    id: Uuid,
    tenant_id: String,
    job_key: String,
    job_type: String,
    status: String,
    attempt: i32,
    max_attempts: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result_summary: Option<Value>,
    actor_user_id: Option<String>,
    request_id: Option<String>,
    broker_job_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobExecutionRow> for JobExecutionRecord {
    type Error = LedgerError;

    fn try_from(row: JobExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| LedgerError::storage("decode_status", e))?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            job_key: row.job_key,
            job_type: row.job_type,
            status,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            result_summary: row.result_summary,
            actor_user_id: row.actor_user_id,
            request_id: row.request_id,
            broker_job_id: row.broker_job_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Ledger backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgExecutionLedger {
    pool: PgPool,
}

impl PgExecutionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from database settings
    pub async fn connect(settings: &DatabaseSettings) -> LedgerResult<Self> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| LedgerError::storage("connect", "database.url is not configured"))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout())
            .connect(url)
            .await
            .map_err(|e| LedgerError::storage("connect", e))?;

        info!(
            max_connections = settings.max_connections,
            "🗄️ Connected execution ledger to PostgreSQL"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn completion_conflict(error: &sqlx::Error) -> bool {
        matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}

#[async_trait]
impl ExecutionLedger for PgExecutionLedger {
    async fn find_completed(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM campus_job_execution_records \
             WHERE tenant_id = $1 AND job_key = $2 AND status = 'completed' LIMIT 1"
        );
        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(tenant_id)
            .bind(job_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::storage("find_completed", e))?
            .map(JobExecutionRecord::try_from)
            .transpose()
    }

    async fn find_latest(
        &self,
        tenant_id: &str,
        job_key: &str,
    ) -> LedgerResult<Option<JobExecutionRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM campus_job_execution_records \
             WHERE tenant_id = $1 AND job_key = $2 ORDER BY created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(tenant_id)
            .bind(job_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::storage("find_latest", e))?
            .map(JobExecutionRecord::try_from)
            .transpose()
    }

    async fn get(&self, id: Uuid) -> LedgerResult<Option<JobExecutionRecord>> {
        let sql =
            format!("SELECT {RECORD_COLUMNS} FROM campus_job_execution_records WHERE id = $1");
        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::storage("get", e))?
            .map(JobExecutionRecord::try_from)
            .transpose()
    }

    async fn create(&self, new: NewJobExecution) -> LedgerResult<JobExecutionRecord> {
        let sql = format!(
            "INSERT INTO campus_job_execution_records \
             (id, tenant_id, job_key, job_type, status, attempt, max_attempts, started_at, \
              actor_user_id, request_id, broker_job_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12) \
             RETURNING {RECORD_COLUMNS}"
        );
        let started_at = (new.status == JobStatus::Processing).then_some(new.created_at);

        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.tenant_id)
            .bind(&new.job_key)
            .bind(&new.job_type)
            .bind(new.status.as_str())
            .bind(new.attempt as i32)
            .bind(new.max_attempts as i32)
            .bind(started_at)
            .bind(&new.actor_user_id)
            .bind(&new.request_id)
            .bind(&new.broker_job_id)
            .bind(new.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if Self::completion_conflict(&e) {
                    LedgerError::AlreadyCompleted {
                        tenant_id: new.tenant_id.clone(),
                        job_key: new.job_key.clone(),
                    }
                } else {
                    LedgerError::storage("create", e)
                }
            })?;

        debug!(record_id = %row.id, job_key = %row.job_key, "📝 Created job execution record");
        JobExecutionRecord::try_from(row)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> LedgerResult<JobExecutionRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::storage("update_status", e))?;

        let select = format!(
            "SELECT {RECORD_COLUMNS} FROM campus_job_execution_records WHERE id = $1 FOR UPDATE"
        );
        let current: JobExecutionRecord = sqlx::query_as::<_, JobExecutionRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| LedgerError::storage("update_status", e))?
            .ok_or(LedgerError::NotFound { id })?
            .try_into()?;
        check_transition(&current, &update)?;

        let mut next = current;
        apply_update(&mut next, update);

        let sql = format!(
            "UPDATE campus_job_execution_records SET status = $2, attempt = $3, \
             started_at = $4, completed_at = $5, error_message = $6, result_summary = $7, \
             updated_at = $8 WHERE id = $1 RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(id)
            .bind(next.status.as_str())
            .bind(next.attempt as i32)
            .bind(next.started_at)
            .bind(next.completed_at)
            .bind(&next.error_message)
            .bind(&next.result_summary)
            .bind(next.updated_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if Self::completion_conflict(&e) {
                    LedgerError::AlreadyCompleted {
                        tenant_id: next.tenant_id.clone(),
                        job_key: next.job_key.clone(),
                    }
                } else {
                    LedgerError::storage("update_status", e)
                }
            })?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::storage("update_status", e))?;

        JobExecutionRecord::try_from(row)
    }

    async fn attach_broker_job(&self, id: Uuid, broker_job_id: &str) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE campus_job_execution_records SET broker_job_id = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(broker_job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::storage("attach_broker_job", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound { id });
        }
        Ok(())
    }

    async fn list_recent(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: u32,
    ) -> LedgerResult<Vec<JobExecutionRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM campus_job_execution_records \
             WHERE tenant_id = $1 \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR job_type = $3) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
             ORDER BY created_at DESC LIMIT $5"
        );
        let rows = sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(tenant_id)
            .bind(filter.status.map(|status| status.as_str()))
            .bind(filter.job_type.as_deref())
            .bind(filter.since)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::storage("list_recent", e))?;

        rows.into_iter().map(JobExecutionRecord::try_from).collect()
    }
}
