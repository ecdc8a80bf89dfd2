//! Job entities as persisted in the `extraction_jobs` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::BTreeMap;

/// Where a job's source material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Object in an S3 bucket, identified by `s3_key`.
    S3,
    /// Publicly fetchable URL.
    Url,
    /// Local file or pre-registered asset, identified by `external_id`.
    Local,
}

/// Describes the work a job should perform.
///
/// Exactly one identifying locator (`s3_key`, `url`, or `external_id`) must be
/// resolvable; the idempotency key is derived from it. `metadata` is an open
/// map carried through to the worker untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Kind of source this job extracts from.
    pub source_type: SourceType,
    /// S3 object key, when the source is an S3 object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    /// Source URL, when the source is a remote file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Caller-assigned identifier, when the source is already registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Free-form metadata passed through to the worker.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Serialization version, bumped when the field set changes.
    #[serde(default = "schema_version")]
    pub schema_version: u32,
}

fn schema_version() -> u32 {
    1
}

impl JobInput {
    /// Create an input with no locator set. One of the `with_*` builders must
    /// be called before the input can be enqueued.
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            s3_key: None,
            url: None,
            external_id: None,
            metadata: BTreeMap::new(),
            schema_version: schema_version(),
        }
    }

    /// Set the S3 object key locator.
    #[must_use]
    pub fn with_s3_key(mut self, s3_key: impl Into<String>) -> Self {
        self.s3_key = Some(s3_key.into());
        self
    }

    /// Set the URL locator.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the external-id locator.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result payload recorded when a job succeeds.
///
/// The queue stores and returns this value without interpreting it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutput {
    /// Identifier of the produced artifact (e.g. the analyzed ad).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_id: Option<String>,
    /// Non-fatal issues encountered by the pipeline, in occurrence order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Version of the extraction pipeline that produced the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_version: Option<String>,
    /// Whether the artifact already existed and extraction was skipped.
    #[serde(default)]
    pub already_existed: bool,
    /// Wall-clock seconds the pipeline spent on this job.
    #[serde(default)]
    pub elapsed_seconds: f64,
    /// Last pipeline stage that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_reached: Option<String>,
    /// Open extension map for fields the queue does not know about.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    /// Serialization version, bumped when the field set changes.
    #[serde(default = "schema_version")]
    pub schema_version: u32,
}

/// Lifecycle state of a job.
///
/// Transitions are monotonic: once a job leaves `Queued` it never re-enters
/// it (stale release re-queues through `Retry`, or fails terminally when no
/// attempts remain), and `Succeeded`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its first claim.
    Queued,
    /// Exclusively owned by a worker.
    Running,
    /// Failed transiently; eligible again once `run_after` passes.
    Retry,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

impl JobStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A persisted job row.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, assigned at creation.
    pub id: i64,
    /// Deterministic fingerprint of the input's identifying locator,
    /// 32 lowercase hex characters.
    pub idempotency_key: String,
    /// The work description.
    pub input: Json<JobInput>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Higher priorities claim first.
    pub priority: i16,
    /// Number of claims so far. Incremented at claim time.
    pub attempts: i32,
    /// Ceiling on `attempts`; once reached, any failure is terminal.
    pub max_attempts: i32,
    /// Identity of the worker holding the lock, while running.
    pub locked_by: Option<String>,
    /// When the current claim happened, while running.
    pub locked_at: Option<DateTime<Utc>>,
    /// Earliest time the job is eligible for claiming.
    pub run_after: DateTime<Utc>,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Most recent failure code.
    pub last_error_code: Option<String>,
    /// Result payload, populated on success.
    pub output: Option<Json<JobOutput>>,
    /// Artifact reference recorded at completion.
    pub artifact_id: Option<String>,
    /// Pipeline stage last reported via heartbeat.
    pub heartbeat_stage: Option<String>,
    /// Progress within the current attempt, 0.0 to 1.0.
    pub heartbeat_progress: Option<f64>,
    /// When the worker last reported liveness.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Tunables for a newly enqueued job. Ignored when the idempotency key
/// resolves to an existing row.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Higher priorities claim first. Defaults to 0.
    pub priority: i16,
    /// Ceiling on claim attempts. Defaults to 5.
    pub max_attempts: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 5,
        }
    }
}

/// Outcome of an [`enqueue`](crate::JobQueue::enqueue) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct EnqueueResult {
    /// Id of the newly created or pre-existing job.
    pub job_id: i64,
    /// The job's status at return time (`Queued` for new rows).
    pub status: JobStatus,
    /// True when the idempotency key matched an existing row, which was
    /// left untouched.
    pub already_existed: bool,
}
