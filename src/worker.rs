use crate::errors::{JobError, QueueError};
use crate::handler::{Heartbeat, JobHandler};
use crate::job::Job;
use crate::queue::JobQueue;
use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<H> {
    pub(crate) queue: JobQueue,
    pub(crate) handler: Arc<H>,
    pub(crate) worker_id: String,
    pub(crate) claim_batch: i64,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<H: JobHandler> Worker<H> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and run jobs forever, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            match self.claim_and_run_batch().await {
                Ok(ran) if ran > 0 => {}
                Ok(_) if self.shutdown_when_queue_empty => {
                    debug!("No claimable jobs found. Shutting down the worker…");
                    break;
                }
                Ok(_) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!(%error, "Failed to process job batch");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim a batch and run its jobs one after another. Returns the batch
    /// size.
    ///
    /// Jobs waiting for their turn get their heartbeat refreshed after every
    /// execution — their liveness clock starts at claim time, so without
    /// this a long-running earlier job would let the reaper take the rest of
    /// the batch. A single handler execution must still stay under the
    /// reaper threshold.
    ///
    /// Handler failures are recorded on the job rows and never propagate;
    /// only store-level errors bubble up.
    async fn claim_and_run_batch(&self) -> Result<usize, QueueError> {
        trace!("Looking for claimable extraction jobs…");
        let jobs = self.queue.claim(&self.worker_id, self.claim_batch).await?;

        let claimed = jobs.len();
        let mut waiting = VecDeque::from(jobs);
        while let Some(job) = waiting.pop_front() {
            self.run_job(job).await?;
            self.refresh_waiting(&mut waiting).await?;
        }
        Ok(claimed)
    }

    /// Heartbeat every not-yet-started batch member, dropping the ones the
    /// reaper has already taken back — running those anyway would execute
    /// the pipeline twice.
    async fn refresh_waiting(&self, waiting: &mut VecDeque<Job>) -> Result<(), QueueError> {
        let mut alive = VecDeque::with_capacity(waiting.len());
        while let Some(job) = waiting.pop_front() {
            match self.queue.heartbeat(job.id, None, None).await {
                Ok(()) => alive.push_back(job),
                Err(QueueError::InvalidState { job_id, actual }) => {
                    warn!(
                        job.id = job_id,
                        job.status = ?actual,
                        "Claimed job was reclaimed before this worker could start it; skipping"
                    );
                }
                Err(error) => return Err(error),
            }
        }
        *waiting = alive;
        Ok(())
    }

    async fn run_job(&self, job: Job) -> Result<(), QueueError> {
        let job_id = job.id;
        let span = info_span!("job", job.id = %job_id, job.attempt = %job.attempts);
        debug!(parent: &span, "Running job…");

        let heartbeat = Heartbeat::new(self.queue.clone(), job_id);
        let result = AssertUnwindSafe(self.handler.run(job, heartbeat))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match result {
            Ok(Ok(output)) => {
                debug!("Job succeeded");
                let artifact_id = output.ad_id.clone();
                self.tolerate_reclaim(
                    self.queue
                        .complete(job_id, &output, artifact_id.as_deref())
                        .await,
                )
            }
            Ok(Err(job_error)) => {
                warn!(%job_error, permanent = job_error.permanent, "Job failed");
                self.tolerate_reclaim(
                    self.queue
                        .fail(
                            job_id,
                            &job_error.message,
                            job_error.code.as_deref(),
                            job_error.permanent,
                        )
                        .await
                        .map(drop),
                )
            }
            Err(panic) => {
                let job_error = JobError::transient(format!(
                    "job handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .with_code("panic");
                error!(%job_error, "Job panicked");
                self.tolerate_reclaim(
                    self.queue
                        .fail(job_id, &job_error.message, job_error.code.as_deref(), false)
                        .await
                        .map(drop),
                )
            }
        }
    }

    /// A rejected transition after execution means the job was reclaimed by
    /// the reaper mid-run (this worker's heartbeats went silent for too
    /// long). The reclaim is legitimate; log it and move on. Everything else
    /// propagates.
    fn tolerate_reclaim(&self, result: Result<(), QueueError>) -> Result<(), QueueError> {
        match result {
            Err(QueueError::InvalidState { job_id, actual }) => {
                warn!(
                    job.id = job_id,
                    job.status = ?actual,
                    "Job was reclaimed while this worker was running it; dropping outcome"
                );
                Ok(())
            }
            other => other,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
