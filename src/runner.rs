//! Worker pool lifecycle: spawn, watch, shut down.

use crate::handler::JobHandler;
use crate::queue::JobQueue;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_CLAIM_BATCH: i64 = 1;

/// Drives a pool of polling workers over a [`JobQueue`].
///
/// Each worker repeatedly claims a batch of jobs, executes the handler for
/// each, and reports outcomes back to the queue. The long-running extraction
/// work happens entirely between claim and completion; the queue itself is
/// only touched by short, bounded calls.
pub struct Runner<H> {
    queue: JobQueue,
    handler: Arc<H>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    claim_batch: i64,
    shutdown_when_queue_empty: bool,
}

impl<H> std::fmt::Debug for Runner<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("claim_batch", &self.claim_batch)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<H: JobHandler> Runner<H> {
    /// Create a runner with one worker and default polling configuration.
    pub fn new(queue: JobQueue, handler: H) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            claim_batch: DEFAULT_CLAIM_BATCH,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of concurrent workers.
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    ///
    /// Jitter reduces thundering-herd effects when many idle workers poll
    /// simultaneously. The applied jitter is uniform between zero and the
    /// given duration.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how many jobs a worker claims per poll.
    ///
    /// Batch members run one after another; the worker heartbeats the
    /// waiting ones between executions. The reaper's staleness threshold
    /// therefore needs to cover one handler execution, not the whole batch.
    #[must_use]
    pub fn claim_batch(mut self, claim_batch: i64) -> Self {
        self.claim_batch = claim_batch;
        self
    }

    /// Shut the workers down once no claimable jobs remain.
    #[must_use]
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers.
    ///
    /// Returns a [`RunHandle`] that can be used to wait for them to shut
    /// down. Worker identities embed the process id so concurrent processes
    /// against the same database stay distinguishable in `locked_by`.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("extraction-worker-{}-{i}", std::process::id());
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                worker_id: name.clone(),
                claim_batch: self.claim_batch,
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle { handles }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}
