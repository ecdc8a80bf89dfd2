//! Crash recovery: the periodic stale-job release loop.

use crate::queue::JobQueue;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{error, trace, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Periodically returns abandoned jobs to the queue.
///
/// A job is abandoned when its worker stops heartbeating — crashed, hung, or
/// partitioned away. There is no worker-liveness registry; heartbeat silence
/// is the only signal. The threshold must comfortably exceed the longest gap
/// between a healthy worker's heartbeats, or running jobs will be released
/// out from under it.
#[derive(Debug)]
pub struct Reaper {
    queue: JobQueue,
    interval: Duration,
    stale_after: Duration,
}

impl Reaper {
    /// Create a reaper with a 60s sweep interval and a 10 minute threshold.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            interval: DEFAULT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Set how often the reaper sweeps.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the heartbeat-age threshold beyond which a running job is
    /// considered abandoned.
    ///
    /// Workers heartbeat at pipeline stage transitions and between batch
    /// members, so the threshold must exceed the longest single gap between
    /// those — in practice, the longest individual handler stage.
    #[must_use]
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Spawn the sweep loop. Runs until the returned handle is aborted.
    pub fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.queue.release_stale(self.stale_after).await {
                    Ok(0) => trace!("No stale jobs found"),
                    Ok(released) => {
                        warn!(released, "Released stale jobs back to the queue");
                    }
                    Err(error) => error!(%error, "Failed to release stale jobs"),
                }
            }
        });
        task.abort_handle()
    }
}
