//! Database bootstrap and schema verification.

use crate::errors::QueueError;
use sqlx::PgPool;
use std::collections::HashSet;

/// Columns of `extraction_jobs` this crate reads or writes. Checked by
/// `verify_schema` before the queue is used.
pub(crate) const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "idempotency_key",
    "input",
    "status",
    "priority",
    "attempts",
    "max_attempts",
    "locked_by",
    "locked_at",
    "run_after",
    "last_error",
    "last_error_code",
    "output",
    "artifact_id",
    "heartbeat_stage",
    "heartbeat_progress",
    "last_heartbeat_at",
    "created_at",
    "finished_at",
];

const CREATE_STATUS_TYPE: &str = r"
    DO $$ BEGIN
        CREATE TYPE job_status AS ENUM ('queued', 'running', 'retry', 'succeeded', 'failed');
    EXCEPTION
        WHEN duplicate_object THEN NULL;
    END $$
";

const CREATE_JOBS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS extraction_jobs (
        id BIGSERIAL PRIMARY KEY,
        idempotency_key TEXT NOT NULL UNIQUE,
        input JSONB NOT NULL,
        status job_status NOT NULL DEFAULT 'queued',
        priority SMALLINT NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 5,
        locked_by TEXT,
        locked_at TIMESTAMPTZ,
        run_after TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_error TEXT,
        last_error_code TEXT,
        output JSONB,
        artifact_id TEXT,
        heartbeat_stage TEXT,
        heartbeat_progress DOUBLE PRECISION,
        last_heartbeat_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        finished_at TIMESTAMPTZ,
        CONSTRAINT extraction_jobs_lock_iff_running
            CHECK ((status = 'running') = (locked_by IS NOT NULL AND locked_at IS NOT NULL))
    )
";

// Partial index matching the claim query's eligibility filter and sort order.
const CREATE_CLAIM_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS index_extraction_jobs_claimable
    ON extraction_jobs (priority DESC, created_at ASC)
    WHERE status IN ('queued', 'retry')
";

const CREATE_STALENESS_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS index_extraction_jobs_running_heartbeat
    ON extraction_jobs (last_heartbeat_at)
    WHERE status = 'running'
";

/// Create the `job_status` type, the `extraction_jobs` table, and its
/// indexes. Idempotent; safe to call on every startup.
pub async fn setup_database(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::query(CREATE_STATUS_TYPE).execute(pool).await?;
    sqlx::query(CREATE_JOBS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_CLAIM_INDEX).execute(pool).await?;
    sqlx::query(CREATE_STALENESS_INDEX).execute(pool).await?;
    Ok(())
}

/// Confirm the live database exposes everything the queue depends on.
///
/// Returns [`QueueError::Schema`] naming every missing element, so a
/// partially migrated database fails at startup with an actionable message
/// instead of opaquely on first use.
pub(crate) async fn verify_schema(pool: &PgPool) -> Result<(), QueueError> {
    let mut missing = Vec::new();

    let status_type_exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'job_status')")
            .fetch_one(pool)
            .await?;
    if !status_type_exists {
        missing.push("type job_status".to_string());
    }

    let columns: Vec<String> = sqlx::query_scalar(
        r"
        SELECT column_name FROM information_schema.columns
        WHERE table_name = 'extraction_jobs' AND table_schema = current_schema()
        ",
    )
    .fetch_all(pool)
    .await?;

    if columns.is_empty() {
        missing.push("table extraction_jobs".to_string());
    } else {
        let present: HashSet<&str> = columns.iter().map(String::as_str).collect();
        missing.extend(
            REQUIRED_COLUMNS
                .iter()
                .filter(|column| !present.contains(**column))
                .map(|column| format!("extraction_jobs.{column}")),
        );
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(QueueError::Schema { missing })
    }
}
