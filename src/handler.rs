use crate::errors::{JobError, QueueError};
use crate::job::{Job, JobOutput};
use crate::queue::JobQueue;
use std::future::Future;

/// The extraction logic a [`Runner`](crate::Runner) drives.
///
/// One handler serves every job the runner claims; the job's input describes
/// what to extract. Implementations should call [`Heartbeat::report`] at each
/// pipeline stage transition so the queue can tell "still working" from
/// "abandoned".
pub trait JobHandler: Send + Sync + 'static {
    /// Execute one job to completion.
    ///
    /// A `JobError` return records the failure on the job row and either
    /// schedules a retry or fails the job terminally; it never crashes the
    /// worker.
    fn run(
        &self,
        job: Job,
        heartbeat: Heartbeat,
    ) -> impl Future<Output = Result<JobOutput, JobError>> + Send;
}

/// Liveness reporter bound to a single claimed job.
///
/// Handed to the handler at execution start. Synchronous in the sense that it
/// runs inline on the calling task — there is no background emitter — and
/// each call is one short database update.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    queue: JobQueue,
    job_id: i64,
}

impl Heartbeat {
    pub(crate) fn new(queue: JobQueue, job_id: i64) -> Self {
        Self { queue, job_id }
    }

    /// The job this reporter is bound to.
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Record the current pipeline stage and progress, refreshing liveness.
    pub async fn report(&self, stage: &str, progress: f64) -> Result<(), QueueError> {
        self.queue
            .heartbeat(self.job_id, Some(stage), Some(progress))
            .await
    }

    /// Refresh liveness without changing stage or progress.
    pub async fn ping(&self) -> Result<(), QueueError> {
        self.queue.heartbeat(self.job_id, None, None).await
    }
}
