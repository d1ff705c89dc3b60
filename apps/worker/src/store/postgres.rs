//! PostgreSQL job store
//!
//! Backed by the `scheduled_jobs` table. Deduplication relies on the partial
//! unique index over `(category, dedup_key)` for Waiting/Running rows, and
//! claiming is a conditional `UPDATE` so concurrent dispatchers (in this or
//! another process) cannot both claim a job.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    EnqueueOutcome, EnqueueRequest, JobKey, JobRecord, JobState, JobStore, StoreError,
    StoreResult,
};
use crate::registry::{JobCategory, Priority};

const JOB_COLUMNS: &str = "id, category, dedup_key, payload, priority, state, attempts, \
                           run_at, created_at, updated_at, last_error";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    category: String,
    dedup_key: String,
    payload: serde_json::Value,
    priority: i16,
    state: String,
    attempts: i32,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Corrupt(format!("job {} has {} attempts", row.id, row.attempts))
        })?;

        Ok(Self {
            id: row.id,
            key: JobKey::new(row.category, row.dedup_key),
            priority: Priority(row.priority),
            payload: row.payload,
            state: row.state.parse()?,
            attempts,
            run_at: row.run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error: row.last_error,
        })
    }
}

/// [`JobStore`] persisted in PostgreSQL
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the worker's migrations
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    fn attempts_param(attempts: u32) -> i32 {
        i32::try_from(attempts).unwrap_or(i32::MAX)
    }

    /// Turn "0 rows updated" into NotFound or a state mismatch
    async fn expect_running(&self, id: Uuid, rows_affected: u64) -> StoreResult<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(record) => Err(StoreError::Corrupt(format!(
                "job {} is {}, expected running",
                id, record.state
            ))),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[tracing::instrument(skip(self, request), fields(key = %request.key))]
    async fn upsert(&self, request: EnqueueRequest) -> StoreResult<EnqueueOutcome> {
        let (id, inserted): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO scheduled_jobs (id, category, dedup_key, payload, priority, state, run_at)
            VALUES ($1, $2, $3, $4, $5, 'waiting', $6)
            ON CONFLICT (category, dedup_key) WHERE state IN ('waiting', 'running')
            DO UPDATE SET
                payload = EXCLUDED.payload,
                priority = EXCLUDED.priority,
                run_at = EXCLUDED.run_at,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.key.category.as_str())
        .bind(&request.key.dedup_key)
        .bind(&request.payload)
        .bind(request.priority.0)
        .bind(request.run_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            EnqueueOutcome::Created(id)
        } else {
            EnqueueOutcome::Updated(id)
        })
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        exclude: &HashSet<JobCategory>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let excluded: Vec<String> = exclude.iter().map(|c| c.as_str().to_string()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scheduled_jobs
            WHERE state = 'waiting'
              AND run_at <= $1
              AND NOT (category = ANY($2))
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(&excluded)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn claim(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'running', updated_at = NOW()
            WHERE id = $1 AND state = 'waiting'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'waiting',
                run_at = $2,
                attempts = $3,
                last_error = COALESCE($4, last_error),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(Self::attempts_param(attempts))
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        self.expect_running(id, result.rows_affected()).await
    }

    async fn mark_completed(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'completed', updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.expect_running(id, result.rows_affected()).await
    }

    async fn mark_failed(&self, id: Uuid, attempts: u32, reason: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'failed', attempts = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(Self::attempts_param(attempts))
        .bind(reason)
        .execute(&self.pool)
        .await?;

        self.expect_running(id, result.rows_affected()).await
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn cancel(&self, key: &JobKey) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'cancelled', updated_at = NOW()
            WHERE category = $1 AND dedup_key = $2 AND state = 'waiting'
            "#,
        )
        .bind(key.category.as_str())
        .bind(&key.dedup_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn find_active(&self, key: &JobKey) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scheduled_jobs
            WHERE category = $1 AND dedup_key = $2 AND state IN ('waiting', 'running')
            "#
        ))
        .bind(key.category.as_str())
        .bind(&key.dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn recover_running(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET state = 'waiting', updated_at = NOW()
            WHERE state = 'running'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count(&self, state: JobState) -> StoreResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scheduled_jobs WHERE state = $1")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
