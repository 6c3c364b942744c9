//! Job handlers for each job kind.

use async_trait::async_trait;
use uuid::Uuid;

use handbook_core::{Error, Job, JobKind, JobOutput};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    /// Worker that owns the claim.
    pub worker_id: String,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job, worker_id: impl Into<String>) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// OCR: object key. Analyze: document id.
    pub fn input_reference(&self) -> &str {
        &self.job.input_reference
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> i32 {
        self.job.attempt_number()
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed with its output.
    Success(JobOutput),
    /// Job failed permanently with an error message.
    Failed(String),
    /// Job hit a transient failure and may be requeued.
    Retry(String),
}

impl JobResult {
    /// Classify a handler error as `Retry` or `Failed`.
    pub fn from_error(error: Error) -> Self {
        if error.is_transient() {
            JobResult::Retry(error.to_string())
        } else {
            JobResult::Failed(error.to_string())
        }
    }
}

impl From<handbook_core::Result<JobOutput>> for JobResult {
    fn from(result: handbook_core::Result<JobOutput>) -> Self {
        match result {
            Ok(output) => JobResult::Success(output),
            Err(e) => JobResult::from_error(e),
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn job() -> Job {
        let now = chrono::Utc::now();
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Ocr,
            status: handbook_core::JobStatus::Processing,
            input_reference: "tenant/rules.pdf".to_string(),
            input_text: None,
            input_metadata: None,
            result: None,
            error_message: None,
            last_error: None,
            attempts: 1,
            max_attempts: 3,
            claimed_by: Some("w1".to_string()),
            claimed_at: Some(now),
            heartbeat_at: Some(now),
            run_after: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_job_context_accessors() {
        let ctx = JobContext::new(job(), "w1");
        assert_eq!(ctx.input_reference(), "tenant/rules.pdf");
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.worker_id, "w1");
    }

    #[test]
    fn test_progress_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = JobContext::new(job(), "w1").with_progress_callback(move |p, _| {
            sink.lock().unwrap().push(p);
        });
        ctx.report_progress(10, None);
        ctx.report_progress(90, Some("almost"));
        assert_eq!(*seen.lock().unwrap(), vec![10, 90]);
    }

    #[test]
    fn test_from_error_classifies() {
        assert!(matches!(
            JobResult::from_error(Error::RateLimited("429".into())),
            JobResult::Retry(_)
        ));
        match JobResult::from_error(Error::InvalidInput("not a pdf".into())) {
            JobResult::Failed(msg) => assert_eq!(msg, "Invalid input: not a pdf"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
