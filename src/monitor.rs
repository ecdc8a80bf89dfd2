//! Read-only monitoring queries.
//!
//! `running_jobs` lets operators spot stalls before the reaper acts on them;
//! `timing_stats` feeds capacity planning with per-outcome latency
//! percentiles.

use crate::errors::QueueError;
use crate::job::JobStatus;
use crate::queue::JobQueue;
use sqlx::FromRow;

/// A currently running job, as seen by operators.
#[derive(Debug, Clone, FromRow)]
pub struct RunningJob {
    /// Job id.
    pub id: i64,
    /// Worker holding the lock.
    pub locked_by: String,
    /// Claim count so far / ceiling.
    pub attempts: i32,
    /// Attempt ceiling.
    pub max_attempts: i32,
    /// Job priority.
    pub priority: i16,
    /// Pipeline stage last reported via heartbeat.
    pub heartbeat_stage: Option<String>,
    /// Progress within the current attempt, 0.0 to 1.0.
    pub heartbeat_progress: Option<f64>,
    /// Seconds since this attempt was claimed.
    pub running_for_secs: f64,
    /// Seconds since the last heartbeat (or the claim, if none yet). Jobs
    /// whose age exceeds the reaper threshold are about to be released.
    pub heartbeat_age_secs: f64,
}

/// Aggregate latency for one terminal status.
#[derive(Debug, Clone, FromRow)]
pub struct TimingStats {
    /// The terminal status this row aggregates (`Succeeded` or `Failed`).
    pub status: JobStatus,
    /// Number of jobs that reached this status.
    pub jobs: i64,
    /// Median seconds from creation to the terminal transition.
    pub p50_secs: f64,
    /// 90th percentile seconds from creation to the terminal transition.
    pub p90_secs: f64,
    /// 99th percentile seconds from creation to the terminal transition.
    pub p99_secs: f64,
    /// Mean claim attempts consumed.
    pub avg_attempts: f64,
}

impl JobQueue {
    /// Snapshot of all `running` jobs, oldest claim first.
    pub async fn running_jobs(&self) -> Result<Vec<RunningJob>, QueueError> {
        let rows = sqlx::query_as::<_, RunningJob>(
            r"
            SELECT id,
                   locked_by,
                   attempts,
                   max_attempts,
                   priority,
                   heartbeat_stage,
                   heartbeat_progress,
                   EXTRACT(EPOCH FROM (NOW() - locked_at))::float8 AS running_for_secs,
                   EXTRACT(EPOCH FROM (NOW() - COALESCE(last_heartbeat_at, locked_at)))::float8
                       AS heartbeat_age_secs
            FROM extraction_jobs
            WHERE status = 'running'
            ORDER BY locked_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Creation-to-terminal latency percentiles, grouped by terminal status.
    pub async fn timing_stats(&self) -> Result<Vec<TimingStats>, QueueError> {
        let rows = sqlx::query_as::<_, TimingStats>(
            r"
            SELECT status,
                   COUNT(*) AS jobs,
                   percentile_cont(0.5) WITHIN GROUP
                       (ORDER BY EXTRACT(EPOCH FROM (finished_at - created_at))::float8)
                       AS p50_secs,
                   percentile_cont(0.9) WITHIN GROUP
                       (ORDER BY EXTRACT(EPOCH FROM (finished_at - created_at))::float8)
                       AS p90_secs,
                   percentile_cont(0.99) WITHIN GROUP
                       (ORDER BY EXTRACT(EPOCH FROM (finished_at - created_at))::float8)
                       AS p99_secs,
                   AVG(attempts)::float8 AS avg_attempts
            FROM extraction_jobs
            WHERE status IN ('succeeded', 'failed') AND finished_at IS NOT NULL
            GROUP BY status
            ORDER BY status
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
