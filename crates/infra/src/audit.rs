//! Postgres audit sink.
//!
//! Appends go to `scriptorium_events` (created by
//! `PostgresJobStore::ensure_schema`). Each append is spawned onto the current
//! runtime and never awaited by the caller; a failed insert is logged and dropped.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::warn;

use scriptorium_events::{AuditSink, JobEvent};

#[derive(Debug, Clone)]
pub struct PostgresAuditSink {
    pool: Arc<PgPool>,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

async fn insert_event(pool: &PgPool, event: &JobEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO scriptorium_events (event_id, job_id, occurred_at, kind, data)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event.event_id)
    .bind(event.job_id.map(|id| id.get()))
    .bind(event.occurred_at)
    .bind(event.kind.as_str())
    .bind(&event.data)
    .execute(pool)
    .await?;
    Ok(())
}

impl AuditSink for PostgresAuditSink {
    fn append(&self, event: JobEvent) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!(kind = %event.kind, "no async runtime; audit event dropped");
                return;
            }
        };

        let pool = self.pool.clone();
        handle.spawn(async move {
            if let Err(err) = insert_event(&pool, &event).await {
                warn!(
                    event_id = %event.event_id,
                    kind = %event.kind,
                    error = %err,
                    "failed to persist audit event"
                );
            }
        });
    }
}
