//! Core traits for the job queue.
//!
//! These traits are the seams between the claim loop and its collaborators,
//! so the loop can run against PostgreSQL and real services in production and
//! against in-memory doubles in tests.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable job table shared by all workers of a kind.
///
/// Every state-changing method is a single conditional write and returns
/// whether it affected the row, so callers can tell a lost race from success.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid>;

    /// Get a job by ID.
    async fn get(&self, kind: JobKind, job_id: Uuid) -> Result<Option<Job>>;

    /// Oldest pending job that is due, without claiming it.
    async fn poll_once(&self, kind: JobKind) -> Result<Option<Job>>;

    /// Atomically move a job from `pending` to `processing` for `worker_id`.
    ///
    /// Returns `false` when another worker won the race.
    async fn claim(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Refresh `heartbeat_at` while `worker_id` still owns the job.
    async fn heartbeat(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// `processing -> done` with the result; clears `error_message`.
    async fn complete(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        output: &JobOutput,
    ) -> Result<bool>;

    /// `processing -> error` with the message; clears `result`.
    async fn fail(&self, kind: JobKind, job_id: Uuid, worker_id: &str, error: &str)
        -> Result<bool>;

    /// `processing -> pending` after a transient failure, counting the attempt
    /// and delaying the next poll by `delay`.
    async fn requeue(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<bool>;

    /// Requeue `processing` jobs whose heartbeat is older than `stale_after`.
    /// Jobs without attempts left are moved to `error` instead.
    async fn requeue_stale(&self, kind: JobKind, stale_after: Duration) -> Result<SweepReport>;

    /// Operator reset: `error -> pending`, clearing the outcome and attempts.
    async fn reset(&self, kind: JobKind, job_id: Uuid) -> Result<bool>;

    /// Count jobs per status.
    async fn stats(&self, kind: JobKind) -> Result<QueueStats>;
}

// =============================================================================
// DOCUMENT SOURCE
// =============================================================================

/// Read access to imported documents for the analyze worker.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>>;
}

// =============================================================================
// OBJECT STORAGE
// =============================================================================

/// Bucket-style object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object's bytes.
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>>;

    /// Upload (create or overwrite) an object.
    async fn upload(&self, bucket: &str, path: &str, data: &[u8], content_type: &str)
        -> Result<()>;

    /// List object paths under a prefix, sorted by name.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, path: &str) -> Result<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

// =============================================================================
// EXTERNAL PROCESSING SERVICES
// =============================================================================

/// Asynchronous document OCR over object storage.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Start an OCR operation.
    async fn submit(&self, request: &OcrRequest) -> Result<OcrOperation>;

    /// Check the state of a submitted operation.
    async fn poll(&self, operation: &OcrOperation) -> Result<OperationState>;

    /// Read the finished operation's text, pages in document order.
    async fn fetch_output(&self, operation: &OcrOperation) -> Result<String>;
}

/// Chat-completion style text generation.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generate a response constrained to a JSON object.
    async fn complete_json(&self, system: &str, prompt: &str) -> Result<String>;

    /// Model used for generation.
    fn model_name(&self) -> &str;
}
