//! End-to-end demo of the extraction queue.
//!
//! Enqueues a handful of video-analysis jobs (with a duplicate to show
//! idempotent enqueue), runs a worker pool whose handler walks through the
//! pipeline stages with heartbeats, lets one job fail transiently, and prints
//! the monitoring views at the end.
//!
//! This demo uses TestContainers to start a throwaway PostgreSQL database,
//! so no manual setup is required. Just run:
//!
//! ```bash
//! cargo run --example pipeline
//! ```

use anyhow::Result;
use extraction_queue::{
    EnqueueOptions, Heartbeat, Job, JobError, JobHandler, JobInput, JobOutput, JobQueue, Reaper,
    Runner, SourceType, setup_database,
};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

const STAGES: &[&str] = &[
    "transcription",
    "storyboard",
    "creative-analysis",
    "toxicity",
    "evidence-alignment",
];

struct Extractor;

impl JobHandler for Extractor {
    async fn run(&self, job: Job, heartbeat: Heartbeat) -> Result<JobOutput, JobError> {
        let locator = job
            .input
            .s3_key
            .clone()
            .or_else(|| job.input.url.clone())
            .unwrap_or_default();

        // One simulated transient hiccup on the first attempt.
        if locator.contains("flaky") && job.attempts == 1 {
            return Err(JobError::transient("upstream transcription timeout")
                .with_code("timeout"));
        }

        let started = std::time::Instant::now();
        for (i, stage) in STAGES.iter().enumerate() {
            heartbeat
                .report(stage, i as f64 / STAGES.len() as f64)
                .await
                .ok();
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        Ok(JobOutput {
            ad_id: Some(format!("ad-{}", job.id)),
            extraction_version: Some("demo-1".to_string()),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            stage_reached: STAGES.last().map(|stage| (*stage).to_string()),
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,extraction_queue=debug".into()),
        )
        .init();

    println!("Starting PostgreSQL container…");
    let container = Postgres::default().start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let pool = PgPool::connect(&format!(
        "postgresql://postgres:postgres@{host}:{port}/postgres"
    ))
    .await?;

    setup_database(&pool).await?;
    let queue = JobQueue::new(pool.clone());
    queue.verify_schema().await?;

    // Safety net for crashed workers; generous threshold since the demo's
    // workers heartbeat every stage.
    let reaper = Reaper::new(queue.clone())
        .interval(Duration::from_secs(5))
        .stale_after(Duration::from_secs(60))
        .start();

    println!("\nEnqueueing extraction jobs…");
    for key in [
        "campaigns/spring/hero.mp4",
        "campaigns/spring/flaky-cutdown.mp4",
        "campaigns/spring/hero.mp4", // duplicate, collapses onto the first
    ] {
        let input = JobInput::new(SourceType::S3)
            .with_s3_key(key)
            .with_metadata("campaign", "spring");
        let enqueued = queue.enqueue(&input).await?;
        println!(
            "  {key} -> job {} (already existed: {})",
            enqueued.job_id, enqueued.already_existed
        );
    }
    let urgent = queue
        .enqueue_with(
            &JobInput::new(SourceType::Url).with_url("https://example.com/breaking.mp4"),
            EnqueueOptions {
                priority: 10,
                ..Default::default()
            },
        )
        .await?;
    println!("  urgent url job {} at priority 10", urgent.job_id);

    println!("\nRunning workers…");
    // Short backoff so the flaky job's retry happens within the demo.
    let retry_queue = queue.clone().with_retry_policy(extraction_queue::RetryPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(4),
    });
    let runner = Runner::new(retry_queue, Extractor)
        .num_workers(2)
        .poll_interval(Duration::from_millis(200))
        .start();

    // Let the first wave start, then peek at the monitoring view.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for running in queue.running_jobs().await? {
        println!(
            "  running: job {} [{}] stage={} progress={:.0}% heartbeat {:.1}s ago",
            running.id,
            running.locked_by,
            running.heartbeat_stage.as_deref().unwrap_or("-"),
            running.heartbeat_progress.unwrap_or(0.0) * 100.0,
            running.heartbeat_age_secs,
        );
    }

    // Wait until everything (including the retried flaky job) is terminal.
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM extraction_jobs WHERE status IN ('queued', 'running', 'retry')",
        )
        .fetch_one(&pool)
        .await?;
        if open == 0 {
            break;
        }
    }

    println!("\nTiming stats:");
    for stats in queue.timing_stats().await? {
        println!(
            "  {:?}: {} jobs, p50 {:.2}s, p99 {:.2}s, avg attempts {:.1}",
            stats.status, stats.jobs, stats.p50_secs, stats.p99_secs, stats.avg_attempts
        );
    }

    reaper.abort();
    drop(runner);
    Ok(())
}
