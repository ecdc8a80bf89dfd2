#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod errors;
mod handler;
pub mod idempotency;
mod job;
mod monitor;
mod queue;
mod reaper;
mod runner;
pub mod schema;
mod worker;

pub use self::errors::{JobError, QueueError};
pub use self::handler::{Heartbeat, JobHandler};
pub use self::job::{EnqueueOptions, EnqueueResult, Job, JobInput, JobOutput, JobStatus, SourceType};
pub use self::monitor::{RunningJob, TimingStats};
pub use self::queue::{JobQueue, RetryPolicy};
pub use self::reaper::Reaper;
pub use self::runner::{RunHandle, Runner};
pub use self::schema::setup_database;
