//! Core data models for the job queue.
//!
//! These types are shared across all crates and mirror the `ocr_jobs` and
//! `analyze_jobs` tables plus the external service handles.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Kind of job; each kind lives in its own table and has its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Extract text from a stored PDF.
    Ocr,
    /// Structure extracted text into handbook sections.
    Analyze,
}

impl JobKind {
    /// All kinds, in a stable order.
    pub const ALL: [JobKind; 2] = [JobKind::Ocr, JobKind::Analyze];

    /// Table holding jobs of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            JobKind::Ocr => "ocr_jobs",
            JobKind::Analyze => "analyze_jobs",
        }
    }

    /// Column holding the kind-specific input reference.
    pub fn reference_column(&self) -> &'static str {
        match self {
            JobKind::Ocr => "file_path",
            JobKind::Analyze => "document_id",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ocr => "ocr",
            JobKind::Analyze => "analyze",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ocr" => Ok(JobKind::Ocr),
            "analyze" | "analyse" => Ok(JobKind::Analyze),
            other => Err(Error::InvalidInput(format!("Unknown job kind: {}", other))),
        }
    }
}

/// Lifecycle status of a job.
///
/// Forward-only: `Pending -> Processing -> Done | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// `Done` and `Error` are terminal; the worker never touches them again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether the claim loop may move a job from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Done)
                | (JobStatus::Processing, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(Error::InvalidInput(format!("Unknown job status: {}", other))),
        }
    }
}

/// Result payload of a completed job.
///
/// OCR jobs produce text, analyze jobs produce a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Text(String),
    Json(JsonValue),
}

impl JobOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            JobOutput::Text(s) => Some(s),
            JobOutput::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            JobOutput::Json(v) => Some(v),
            JobOutput::Text(_) => None,
        }
    }

    /// Whether the payload carries no usable content.
    pub fn is_empty(&self) -> bool {
        match self {
            JobOutput::Text(s) => s.trim().is_empty(),
            JobOutput::Json(v) => v.is_null(),
        }
    }
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// OCR: object key in the source bucket. Analyze: `document_imports.id`.
    pub input_reference: String,
    /// Analyze only: text supplied inline at enqueue time.
    pub input_text: Option<String>,
    /// Analyze only: document metadata supplied inline at enqueue time.
    pub input_metadata: Option<JsonValue>,
    pub result: Option<JobOutput>,
    pub error_message: Option<String>,
    /// Last transient failure that caused a requeue.
    pub last_error: Option<String>,
    /// Number of finished or abandoned attempts.
    pub attempts: i32,
    pub max_attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// The job is not polled before this instant.
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 1-based number of the attempt currently running (or next to run).
    pub fn attempt_number(&self) -> i32 {
        self.attempts + 1
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_number() < self.max_attempts
    }
}

/// Request to insert a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub input_reference: String,
    pub input_text: Option<String>,
    pub input_metadata: Option<JsonValue>,
    pub max_attempts: Option<i32>,
}

impl NewJob {
    /// OCR job for a file in the source bucket.
    pub fn ocr(file_path: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Ocr,
            input_reference: file_path.into(),
            input_text: None,
            input_metadata: None,
            max_attempts: None,
        }
    }

    /// Analyze job for a previously imported document.
    pub fn analyze(document_id: Uuid) -> Self {
        Self {
            kind: JobKind::Analyze,
            input_reference: document_id.to_string(),
            input_text: None,
            input_metadata: None,
            max_attempts: None,
        }
    }

    /// Supply the text inline instead of reading `document_imports`.
    pub fn with_text(mut self, text: impl Into<String>, metadata: Option<JsonValue>) -> Self {
        self.input_text = Some(text.into());
        self.input_metadata = metadata;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

/// Per-kind queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub error: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.done + self.error
    }
}

/// Outcome of one stale-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs put back to `pending`.
    pub requeued: u64,
    /// Jobs moved to `error` because no attempts were left.
    pub abandoned: u64,
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Imported document as read by the analyze worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub file_name: Option<String>,
    pub extracted_text: Option<String>,
    pub metadata: Option<JsonValue>,
}

// =============================================================================
// OCR PROVIDER
// =============================================================================

/// Request for an asynchronous OCR batch over object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrRequest {
    /// Location of the staged input, e.g. `gs://bucket/ocr-input/<id>.pdf`.
    pub input_uri: String,
    /// Prefix the provider writes results under, e.g. `gs://bucket/ocr-output/<id>/`.
    pub output_uri: String,
    pub mime_type: String,
}

/// Handle for a submitted OCR operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrOperation {
    /// Provider operation name.
    pub name: String,
    /// Output prefix the results will be read from.
    pub output_uri: String,
}

/// Provider-side state of an OCR operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Failed(String),
}

/// Split a `gs://bucket/path` URI into bucket and path.
pub fn parse_gs_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("gs://")?;
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_tables() {
        assert_eq!(JobKind::Ocr.table(), "ocr_jobs");
        assert_eq!(JobKind::Analyze.table(), "analyze_jobs");
        assert_eq!(JobKind::Ocr.reference_column(), "file_path");
        assert_eq!(JobKind::Analyze.reference_column(), "document_id");
    }

    #[test]
    fn test_job_kind_parse() {
        assert_eq!("ocr".parse::<JobKind>().unwrap(), JobKind::Ocr);
        assert_eq!(" Analyze ".parse::<JobKind>().unwrap(), JobKind::Analyze);
        assert!("embedding".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_status_transitions_forward_only() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Done,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_job_output_emptiness() {
        assert!(JobOutput::Text("  \n".into()).is_empty());
        assert!(!JobOutput::Text("Regel 1".into()).is_empty());
        assert!(JobOutput::Json(JsonValue::Null).is_empty());
        assert!(!JobOutput::Json(serde_json::json!({"sections": []})).is_empty());
    }

    #[test]
    fn test_new_job_builders() {
        let id = Uuid::new_v4();
        let job = NewJob::analyze(id)
            .with_text("Regel 1", Some(serde_json::json!({"pages": 1})))
            .with_max_attempts(0);
        assert_eq!(job.kind, JobKind::Analyze);
        assert_eq!(job.input_reference, id.to_string());
        assert_eq!(job.input_text.as_deref(), Some("Regel 1"));
        assert_eq!(job.max_attempts, Some(1));

        let job = NewJob::ocr("tenant/a.pdf");
        assert_eq!(job.kind, JobKind::Ocr);
        assert_eq!(job.input_reference, "tenant/a.pdf");
    }

    #[test]
    fn test_parse_gs_uri() {
        assert_eq!(
            parse_gs_uri("gs://vision/ocr-output/abc/"),
            Some(("vision", "ocr-output/abc/"))
        );
        assert_eq!(parse_gs_uri("gs://vision"), Some(("vision", "")));
        assert_eq!(parse_gs_uri("s3://vision/a"), None);
        assert_eq!(parse_gs_uri("gs:///a"), None);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            pending: 1,
            processing: 2,
            done: 3,
            error: 4,
        };
        assert_eq!(stats.total(), 10);
    }
}
