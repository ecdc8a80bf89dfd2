use crate::job::JobStatus;

/// Errors surfaced by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The job input carries no identifying locator, so no idempotency key
    /// can be derived. Raised synchronously from `enqueue`; never persisted.
    #[error("job input has no identifying locator (expected one of s3_key, url, external_id)")]
    MissingLocator,

    /// A state transition was requested on a job that is not currently
    /// `running` — e.g. a double completion, or a job already reclaimed by
    /// the stale-job reaper. Signals a potential double-processing bug and is
    /// therefore reported rather than silently ignored.
    #[error("job {job_id} is {actual:?}, not running; transition rejected")]
    InvalidState {
        /// The job the caller tried to transition.
        job_id: i64,
        /// The status the row actually had.
        actual: JobStatus,
    },

    /// The referenced job does not exist.
    #[error("job {job_id} not found")]
    NotFound {
        /// The missing job id.
        job_id: i64,
    },

    /// The backing store is missing structure this crate depends on.
    /// Raised by [`verify_schema`](crate::JobQueue::verify_schema) before any
    /// per-job operation runs.
    #[error("database schema is missing required elements: {}", missing.join(", "))]
    Schema {
        /// Fully qualified names of the missing columns/types.
        missing: Vec<String>,
    },

    /// A store-level failure. Propagated to the caller to retry or escalate;
    /// the queue embeds no retry loop of its own.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Job input or output could not be (de)serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// The outcome a job handler reports for a failed execution.
///
/// `permanent` failures (malformed or unsupported input) are terminal
/// immediately; transient failures (timeouts, rate limits) re-queue the job
/// with backoff until its attempts are exhausted.
#[derive(Debug)]
pub struct JobError {
    /// Human-readable failure description, recorded as `last_error`.
    pub message: String,
    /// Optional machine-readable code, recorded as `last_error_code`.
    pub code: Option<String>,
    /// Whether the failure is unrecoverable regardless of remaining attempts.
    pub permanent: bool,
}

impl JobError {
    /// A recoverable failure; the job becomes eligible again after backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            permanent: false,
        }
    }

    /// An unrecoverable failure; the job is failed terminally.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            permanent: true,
        }
    }

    /// Attach a machine-readable error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<anyhow::Error> for JobError {
    /// Untyped handler errors are assumed recoverable.
    fn from(error: anyhow::Error) -> Self {
        Self::transient(format!("{error:#}"))
    }
}
