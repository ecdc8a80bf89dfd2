//! The queue orchestration API: enqueue, claim, heartbeat, complete, fail,
//! and stale-job release.
//!
//! Every operation is a single short statement (or bounded transaction)
//! against Postgres; nothing here blocks for the duration of job execution.
//! All cross-worker coordination is mediated by the database — claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers partition the eligible
//! set without blocking each other.

use crate::errors::QueueError;
use crate::job::{EnqueueOptions, EnqueueResult, Job, JobInput, JobOutput, JobStatus};
use crate::{idempotency, schema};
use sqlx::PgPool;
use sqlx::types::Json;
use std::time::Duration;
use tracing::instrument;

/// Backoff parameters for transient failures.
///
/// The delay before a job's n-th retry is `base * 2^(n-1)`, capped at `cap`:
/// monotonically increasing in the attempt count and bounded, so a flapping
/// job backs off quickly without ever being delayed indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

/// Handle to the persistent job queue.
///
/// Cheap to clone; all clones share the same connection pool. The queue holds
/// no job state of its own — the database is the single source of truth.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pub(crate) pool: PgPool,
    retry_policy: RetryPolicy,
}

impl JobQueue {
    /// Create a queue over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Override the default retry backoff parameters.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Fail fast if the backing database is missing anything this queue
    /// depends on. Call once at startup, before any other operation.
    pub async fn verify_schema(&self) -> Result<(), QueueError> {
        schema::verify_schema(&self.pool).await
    }

    /// Enqueue a job with default priority and attempt ceiling.
    pub async fn enqueue(&self, input: &JobInput) -> Result<EnqueueResult, QueueError> {
        self.enqueue_with(input, EnqueueOptions::default()).await
    }

    /// Enqueue a job, deduplicating on its idempotency key.
    ///
    /// If a job with the same key already exists, the existing row is
    /// returned untouched — no attempt reset, no re-queue — with
    /// `already_existed = true`. The insert-or-return is a single atomic
    /// statement, so two concurrent enqueues with the same key can never
    /// produce two rows.
    #[instrument(name = "queue.enqueue", skip(self, input), fields(source_type = ?input.source_type))]
    pub async fn enqueue_with(
        &self,
        input: &JobInput,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult, QueueError> {
        let key = idempotency::key_for(input)?;
        let payload = serde_json::to_value(input)?;

        let inserted = sqlx::query_as::<_, EnqueueResult>(
            r"
            WITH new_job AS (
                INSERT INTO extraction_jobs (idempotency_key, input, priority, max_attempts)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING id, status
            )
            SELECT id AS job_id, status, FALSE AS already_existed FROM new_job
            UNION ALL
            SELECT id AS job_id, status, TRUE AS already_existed
            FROM extraction_jobs
            WHERE idempotency_key = $1 AND NOT EXISTS (SELECT 1 FROM new_job)
            LIMIT 1
            ",
        )
        .bind(&key)
        .bind(Json(payload))
        .bind(options.priority)
        .bind(options.max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(result) = inserted {
            return Ok(result);
        }

        // Snapshot edge: a concurrent insert with the same key committed
        // after this statement's snapshot was taken. The conflicting row is
        // visible to a fresh statement.
        let existing = sqlx::query_as::<_, EnqueueResult>(
            "SELECT id AS job_id, status, TRUE AS already_existed
             FROM extraction_jobs WHERE idempotency_key = $1",
        )
        .bind(&key)
        .fetch_one(&self.pool)
        .await?;

        Ok(existing)
    }

    /// Atomically claim up to `limit` eligible jobs for `worker_id`.
    ///
    /// Eligible rows are `queued` or `retry` with `run_after` in the past
    /// and claim attempts remaining, taken in priority-descending,
    /// oldest-first order. Rows locked by a
    /// concurrent claimer are skipped rather than waited on, so no two
    /// callers ever receive the same job and one slow claimer cannot stall
    /// others. An empty result is the normal "no work" case.
    ///
    /// Claiming increments `attempts` and primes the heartbeat fields, so a
    /// worker that dies before its first heartbeat is still reclaimable by
    /// lock age.
    #[instrument(name = "queue.claim", skip(self))]
    pub async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<Job>, QueueError> {
        let mut jobs = sqlx::query_as::<_, Job>(
            r"
            WITH eligible AS (
                SELECT id FROM extraction_jobs
                WHERE status IN ('queued', 'retry')
                  AND run_after <= NOW()
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE extraction_jobs AS job
            SET status = 'running',
                locked_by = $1,
                locked_at = NOW(),
                attempts = job.attempts + 1,
                heartbeat_stage = 'claimed',
                heartbeat_progress = 0,
                last_heartbeat_at = NOW()
            FROM eligible
            WHERE job.id = eligible.id
            RETURNING job.*
            ",
        )
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE .. RETURNING does not preserve the subquery's order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(jobs)
    }

    /// Refresh a running job's liveness, optionally recording the current
    /// pipeline stage and progress.
    ///
    /// Idempotent and safe to call repeatedly. Heartbeat silence is the sole
    /// signal by which abandoned jobs are detected, so workers should call
    /// this at least at every stage transition.
    pub async fn heartbeat(
        &self,
        job_id: i64,
        stage: Option<&str>,
        progress: Option<f64>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE extraction_jobs
            SET last_heartbeat_at = NOW(),
                heartbeat_stage = COALESCE($2, heartbeat_stage),
                heartbeat_progress = COALESCE($3, heartbeat_progress)
            WHERE id = $1 AND status = 'running'
            ",
        )
        .bind(job_id)
        .bind(stage)
        .bind(progress)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_running(job_id).await?);
        }
        Ok(())
    }

    /// Mark a running job as succeeded, storing its output.
    ///
    /// Rejected with [`QueueError::InvalidState`] if the job is not currently
    /// `running` — e.g. it was already completed, or reclaimed as stale —
    /// since silently accepting that would mask a double-processing bug.
    #[instrument(name = "queue.complete", skip(self, output))]
    pub async fn complete(
        &self,
        job_id: i64,
        output: &JobOutput,
        artifact_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE extraction_jobs
            SET status = 'succeeded',
                output = $2,
                artifact_id = $3,
                locked_by = NULL,
                locked_at = NULL,
                finished_at = NOW()
            WHERE id = $1 AND status = 'running'
            ",
        )
        .bind(job_id)
        .bind(Json(output))
        .bind(artifact_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_running(job_id).await?);
        }
        Ok(())
    }

    /// Record a running job's failure and schedule what happens next.
    ///
    /// Permanent failures, and transient failures once `attempts` has reached
    /// `max_attempts`, are terminal. Otherwise the job moves to `retry` with
    /// `run_after` pushed out by the [`RetryPolicy`] backoff. Returns the
    /// status the job ended up in (`Failed` or `Retry`).
    #[instrument(name = "queue.fail", skip(self, message))]
    pub async fn fail(
        &self,
        job_id: i64,
        message: &str,
        error_code: Option<&str>,
        permanent: bool,
    ) -> Result<JobStatus, QueueError> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE extraction_jobs
            SET status = CASE WHEN $4 OR attempts >= max_attempts
                              THEN 'failed'::job_status
                              ELSE 'retry'::job_status END,
                run_after = CASE WHEN $4 OR attempts >= max_attempts
                                 THEN run_after
                                 ELSE NOW() + make_interval(secs =>
                                      LEAST($5 * POWER(2.0, GREATEST(attempts - 1, 0)), $6)) END,
                finished_at = CASE WHEN $4 OR attempts >= max_attempts
                                   THEN NOW()
                                   ELSE finished_at END,
                last_error = $2,
                last_error_code = $3,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'running'
            RETURNING status
            ",
        )
        .bind(job_id)
        .bind(message)
        .bind(error_code)
        .bind(permanent)
        .bind(self.retry_policy.base.as_secs_f64())
        .bind(self.retry_policy.cap.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => Ok(status),
            None => Err(self.not_running(job_id).await?),
        }
    }

    /// Return running jobs whose heartbeat (or claim, if no heartbeat ever
    /// arrived) is older than `stale_after` to the queue.
    ///
    /// Released jobs become claimable immediately. `attempts` is not
    /// incremented again — that already happened at claim time — and the
    /// abandoning worker's cooperation is not required: a dead worker is
    /// inferred purely from heartbeat silence. A stale job whose claim was
    /// already its last allowed attempt has nothing left to retry and is
    /// failed terminally instead, keeping `attempts` within `max_attempts`.
    /// Returns the number of jobs transitioned either way.
    #[instrument(name = "queue.release_stale", skip(self, stale_after))]
    pub async fn release_stale(&self, stale_after: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r"
            UPDATE extraction_jobs
            SET status = CASE WHEN attempts >= max_attempts
                              THEN 'failed'::job_status
                              WHEN attempts = 0
                              THEN 'queued'::job_status
                              ELSE 'retry'::job_status END,
                last_error = CASE WHEN attempts >= max_attempts
                                  THEN 'worker went silent and no attempts remain'
                                  ELSE last_error END,
                last_error_code = CASE WHEN attempts >= max_attempts
                                       THEN 'worker_lost'
                                       ELSE last_error_code END,
                finished_at = CASE WHEN attempts >= max_attempts
                                   THEN NOW()
                                   ELSE finished_at END,
                locked_by = NULL,
                locked_at = NULL,
                run_after = NOW()
            WHERE status = 'running'
              AND COALESCE(last_heartbeat_at, locked_at) < NOW() - make_interval(secs => $1)
            ",
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fetch a single job snapshot, if it exists.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM extraction_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Diagnose a zero-row state transition: the job is either gone or not
    /// `running`. Returns the error to report.
    async fn not_running(&self, job_id: i64) -> Result<QueueError, QueueError> {
        let actual = sqlx::query_scalar::<_, JobStatus>(
            "SELECT status FROM extraction_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match actual {
            Some(actual) => QueueError::InvalidState { job_id, actual },
            None => QueueError::NotFound { job_id },
        })
    }
}
