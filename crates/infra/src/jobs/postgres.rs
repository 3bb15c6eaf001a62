//! Postgres-backed job store.
//!
//! ## Atomicity
//!
//! | Operation | Condition |
//! |-----------|-----------|
//! | `claim_next_pending` | sub-select `FOR UPDATE SKIP LOCKED` on `status = 'pending'`; bumps `lease` |
//! | `update_status` | row locked with `SELECT … FOR UPDATE`, then `StatusUpdate::check` |
//! | `record_phases` / `heartbeat` | `lease = <worker's lease>` |
//! | `reap_stale` | `status = 'in_progress'` and last signal older than the cutoff; bumps `lease` |
//!
//! All but `update_status` are a single conditional `UPDATE`. When one matches
//! no row, a follow-up read tells `NotFound` apart from a lost race.
//!
//! Phases are stored as one `JSONB` array per job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::instrument;

use scriptorium_core::{Job, JobId, JobStatus, NewJob, Phase};

use super::store::{JobStats, JobStore, JobStoreError, ReapAction, StatusUpdate};

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scriptorium_jobs (
    id               BIGSERIAL PRIMARY KEY,
    source           TEXT NOT NULL,
    priority         INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'pending',
    phases           JSONB NOT NULL DEFAULT '[]'::jsonb,
    current_phase    TEXT,
    duration_minutes DOUBLE PRECISION,
    tier_override    INTEGER,
    min_tier         INTEGER,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 3,
    lease            INTEGER NOT NULL DEFAULT 0,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at       TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    last_heartbeat   TIMESTAMPTZ,
    error_message    TEXT,
    error_timestamp  TIMESTAMPTZ,
    total_cost       DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_tokens     BIGINT NOT NULL DEFAULT 0,
    metadata         JSONB NOT NULL DEFAULT 'null'::jsonb
);

ALTER TABLE scriptorium_jobs ADD COLUMN IF NOT EXISTS lease INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS scriptorium_jobs_claim_idx
    ON scriptorium_jobs (status, priority DESC, created_at, id);

CREATE TABLE IF NOT EXISTS scriptorium_events (
    event_id    UUID PRIMARY KEY,
    job_id      BIGINT,
    occurred_at TIMESTAMPTZ NOT NULL,
    kind        TEXT NOT NULL,
    data        JSONB NOT NULL DEFAULT 'null'::jsonb
);

CREATE INDEX IF NOT EXISTS scriptorium_events_job_idx
    ON scriptorium_events (job_id, occurred_at);
"#;

const COLUMNS: &str = "id, source, priority, status, phases, current_phase, duration_minutes, \
    tier_override, min_tier, retry_count, max_retries, lease, created_at, started_at, completed_at, \
    last_heartbeat, error_message, error_timestamp, total_cost, total_tokens, metadata";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes when missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// After a lease-guarded UPDATE matched nothing: missing job, or lease lost.
    async fn explain_miss(&self, id: JobId) -> JobStoreError {
        match self.get(id).await {
            Ok(_) => JobStoreError::LeaseLost(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(source = %new.source, priority = new.priority), err)]
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let sql = format!(
            "INSERT INTO scriptorium_jobs \
                (source, priority, max_retries, duration_minutes, tier_override, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&new.source)
            .bind(new.priority)
            .bind(to_i32(new.max_retries as usize)?)
            .bind(new.duration_minutes)
            .bind(new.tier_override.map(to_i32).transpose()?)
            .bind(&new.metadata)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM scriptorium_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM scriptorium_jobs \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY priority DESC, created_at ASC, id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scriptorium_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
            stats.count(status, n.max(0) as usize);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE scriptorium_jobs \
             SET status = 'in_progress', lease = lease + 1, started_at = now(), \
                 completed_at = NULL, last_heartbeat = NULL \
             WHERE id = ( \
                 SELECT id FROM scriptorium_jobs \
                 WHERE status = 'pending' \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next_pending", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, update), fields(job_id = %id, to = %update.status), err)]
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {COLUMNS} FROM scriptorium_jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        let mut job = job_from_row(&row)?;

        // Dropping `tx` without commit rolls back and releases the row lock.
        update.check(&job)?;
        update.apply(&mut job);

        let phases = serde_json::to_value(&job.phases)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "UPDATE scriptorium_jobs SET \
                status = $2, phases = $3, current_phase = $4, min_tier = $5, retry_count = $6, \
                started_at = $7, completed_at = $8, last_heartbeat = $9, \
                error_message = $10, error_timestamp = $11 \
             WHERE id = $1",
        )
        .bind(id.get())
        .bind(job.status.as_str())
        .bind(phases)
        .bind(job.current_phase.as_deref())
        .bind(job.min_tier.map(to_i32).transpose()?)
        .bind(to_i32(job.retry_count as usize)?)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_heartbeat)
        .bind(job.error_message.as_deref())
        .bind(job.error_timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self, phases), fields(job_id = %id, phase_count = phases.len()), err)]
    async fn record_phases(
        &self,
        id: JobId,
        lease: u32,
        phases: &[Phase],
        current_phase: Option<&str>,
    ) -> Result<(), JobStoreError> {
        let phases =
            serde_json::to_value(phases).map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE scriptorium_jobs SET phases = $2, current_phase = $3 \
             WHERE id = $1 AND lease = $4",
        )
        .bind(id.get())
        .bind(phases)
        .bind(current_phase)
        .bind(lease_param(lease)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_phases", e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn add_run_costs(&self, id: JobId, cost: f64, tokens: u64) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE scriptorium_jobs \
             SET total_cost = total_cost + $2, total_tokens = total_tokens + $3 \
             WHERE id = $1",
        )
        .bind(id.get())
        .bind(cost)
        .bind(i64::try_from(tokens).unwrap_or(i64::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_run_costs", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    async fn heartbeat(&self, id: JobId, lease: u32, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE scriptorium_jobs \
             SET last_heartbeat = CASE WHEN status = 'in_progress' THEN $2 ELSE last_heartbeat END \
             WHERE id = $1 AND lease = $3",
        )
        .bind(id.get())
        .bind(at)
        .bind(lease_param(lease)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a lost lease from a missing job.
        self.get(id).await.map(|_| false)
    }

    #[instrument(skip(self), err)]
    async fn find_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM scriptorium_jobs \
             WHERE status = 'in_progress' \
               AND COALESCE(last_heartbeat, started_at, created_at) < $1 \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_stale", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, message), fields(job_id = %id), err)]
    async fn reap_stale(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Option<ReapAction>, JobStoreError> {
        // SET expressions see the old row, so `retry_count + 1` is the new count throughout.
        let row = sqlx::query(
            "UPDATE scriptorium_jobs SET \
                retry_count = retry_count + 1, \
                lease = lease + 1, \
                status = CASE WHEN retry_count + 1 < max_retries THEN 'pending' ELSE 'failed' END, \
                started_at = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE started_at END, \
                current_phase = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE current_phase END, \
                last_heartbeat = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE last_heartbeat END, \
                completed_at = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE now() END, \
                error_message = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE $3 END, \
                error_timestamp = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE now() END \
             WHERE id = $1 \
               AND status = 'in_progress' \
               AND COALESCE(last_heartbeat, started_at, created_at) < $2 \
             RETURNING status, retry_count",
        )
        .bind(id.get())
        .bind(stale_before)
        .bind(message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_stale", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(|e| map_sqlx_error("reap_stale", e))?;
        let retry_count: i32 = row
            .try_get("retry_count")
            .map_err(|e| map_sqlx_error("reap_stale", e))?;
        let retry_count = retry_count.max(0) as u32;
        Ok(Some(if status == JobStatus::Pending.as_str() {
            ReapAction::Reset { retry_count }
        } else {
            ReapAction::Failed { retry_count }
        }))
    }
}

fn lease_param(lease: u32) -> Result<i32, JobStoreError> {
    to_i32(lease as usize)
}

fn to_i32(value: usize) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Serialization(format!("value {value} does not fit in INTEGER")))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Serialization(format!("failed to read job row: {e}"));

    let status: String = row.try_get("status").map_err(read)?;
    let phases: serde_json::Value = row.try_get("phases").map_err(read)?;
    let phases: Vec<Phase> = serde_json::from_value(phases)
        .map_err(|e| JobStoreError::Serialization(format!("invalid phases: {e}")))?;
    let tier_override: Option<i32> = row.try_get("tier_override").map_err(read)?;
    let min_tier: Option<i32> = row.try_get("min_tier").map_err(read)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(read)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(read)?;
    let lease: i32 = row.try_get("lease").map_err(read)?;
    let total_tokens: i64 = row.try_get("total_tokens").map_err(read)?;

    Ok(Job {
        id: JobId::new(row.try_get("id").map_err(read)?),
        source: row.try_get("source").map_err(read)?,
        priority: row.try_get("priority").map_err(read)?,
        status: status
            .parse()
            .map_err(|e: scriptorium_core::DomainError| JobStoreError::Serialization(e.to_string()))?,
        phases,
        current_phase: row.try_get("current_phase").map_err(read)?,
        duration_minutes: row.try_get("duration_minutes").map_err(read)?,
        tier_override: tier_override.map(|t| t.max(0) as usize),
        min_tier: min_tier.map(|t| t.max(0) as usize),
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        lease: lease.max(0) as u32,
        created_at: row.try_get("created_at").map_err(read)?,
        started_at: row.try_get("started_at").map_err(read)?,
        completed_at: row.try_get("completed_at").map_err(read)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
        error_timestamp: row.try_get("error_timestamp").map_err(read)?,
        total_cost: row.try_get("total_cost").map_err(read)?,
        total_tokens: total_tokens.max(0) as u64,
        metadata: row.try_get("metadata").map_err(read)?,
    })
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_covers_every_selected_column() {
        for column in COLUMNS.split(',').map(str::trim) {
            assert!(
                SCHEMA.contains(&format!("    {column} ")),
                "column {column} missing from schema"
            );
        }
    }

    #[test]
    fn sqlx_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolClosed),
            JobStoreError::Storage(msg) if msg.contains("claim")
        ));
    }
}
