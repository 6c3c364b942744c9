//! OCR job handler: source PDF in, extracted text out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use handbook_core::defaults::{
    OCR_INPUT_PREFIX, OCR_MAX_WAIT_SECS, OCR_OUTPUT_PREFIX, OCR_POLL_INTERVAL_MS, SOURCE_BUCKET,
};
use handbook_core::{
    Error, JobKind, JobOutput, ObjectStore, OcrOperation, OcrProvider, OcrRequest,
    OperationState, Result,
};

use crate::handler::{JobContext, JobHandler, JobResult};

const PDF_MIME: &str = "application/pdf";
const PDF_MAGIC: &[u8] = b"%PDF";

/// Configuration for [`OcrHandler`].
#[derive(Debug, Clone)]
pub struct OcrHandlerConfig {
    /// Bucket holding uploaded documents.
    pub source_bucket: String,
    /// Bucket the OCR provider reads input from and writes output to.
    pub staging_bucket: String,
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
    /// Scratch directory; the OS temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Delete staged input and output after each job.
    pub cleanup_staging: bool,
}

impl OcrHandlerConfig {
    pub fn new(staging_bucket: impl Into<String>) -> Self {
        Self {
            source_bucket: SOURCE_BUCKET.to_string(),
            staging_bucket: staging_bucket.into(),
            poll_interval_ms: OCR_POLL_INTERVAL_MS,
            max_wait_secs: OCR_MAX_WAIT_SECS,
            scratch_dir: None,
            cleanup_staging: true,
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GOOGLE_CLOUD_VISION_BUCKET` | required | Staging bucket |
    /// | `SUPABASE_STORAGE_BUCKET` | `documents` | Source bucket |
    /// | `OCR_POLL_INTERVAL_MS` | `5000` | Operation poll period |
    /// | `OCR_MAX_WAIT_SECS` | `600` | Bound on one OCR operation |
    /// | `OCR_SCRATCH_DIR` | OS temp dir | Scratch file location |
    /// | `OCR_CLEANUP_STAGING` | `true` | Delete staged objects afterwards |
    pub fn from_env() -> Result<Self> {
        let staging = std::env::var("GOOGLE_CLOUD_VISION_BUCKET")
            .ok()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| Error::Config("GOOGLE_CLOUD_VISION_BUCKET is not set".into()))?;

        let mut config = Self::new(staging);
        if let Ok(bucket) = std::env::var("SUPABASE_STORAGE_BUCKET") {
            if !bucket.trim().is_empty() {
                config.source_bucket = bucket;
            }
        }
        if let Some(ms) = std::env::var("OCR_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.poll_interval_ms = ms;
        }
        if let Some(secs) = std::env::var("OCR_MAX_WAIT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_wait_secs = secs;
        }
        config.scratch_dir = std::env::var("OCR_SCRATCH_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);
        config.cleanup_staging = std::env::var("OCR_CLEANUP_STAGING")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        Ok(config)
    }

    pub fn with_source_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.source_bucket = bucket.into();
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_wait(mut self, secs: u64) -> Self {
        self.max_wait_secs = secs;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_cleanup_staging(mut self, cleanup: bool) -> Self {
        self.cleanup_staging = cleanup;
        self
    }

    /// Staged input object for one attempt of a job.
    ///
    /// Keyed by attempt so a reclaimed run never touches its successor's files.
    pub fn input_path(job_id: Uuid, attempt: i32) -> String {
        format!("{}/{}/attempt-{}.pdf", OCR_INPUT_PREFIX, job_id, attempt)
    }

    /// Prefix the provider writes one attempt's output under.
    pub fn output_prefix(job_id: Uuid, attempt: i32) -> String {
        format!("{}/{}/attempt-{}/", OCR_OUTPUT_PREFIX, job_id, attempt)
    }
}

/// Handler for OCR jobs.
pub struct OcrHandler {
    source: Arc<dyn ObjectStore>,
    staging: Arc<dyn ObjectStore>,
    provider: Arc<dyn OcrProvider>,
    config: OcrHandlerConfig,
}

impl OcrHandler {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        staging: Arc<dyn ObjectStore>,
        provider: Arc<dyn OcrProvider>,
        config: OcrHandlerConfig,
    ) -> Self {
        Self {
            source,
            staging,
            provider,
            config,
        }
    }

    async fn recognize(&self, ctx: &JobContext) -> Result<String> {
        let job_id = ctx.job_id();
        let path = ctx.input_reference().trim();
        if path.is_empty() {
            return Err(Error::InvalidInput("OCR job has no file_path".into()));
        }

        let data = self.source.download(&self.config.source_bucket, path).await?;
        debug!(
            subsystem = "ocr",
            component = "handler",
            job_id = %job_id,
            bucket = %self.config.source_bucket,
            path,
            bytes = data.len(),
            "Downloaded source document"
        );
        if !data.starts_with(PDF_MAGIC) {
            return Err(Error::InvalidInput(format!("{} is not a PDF", path)));
        }
        ctx.report_progress(10, Some("downloaded"));

        // Removed when dropped, on every exit path.
        let scratch = self.scratch_file()?;
        tokio::fs::write(scratch.path(), &data).await?;
        drop(data);
        let staged = tokio::fs::read(scratch.path()).await?;

        let input_path = OcrHandlerConfig::input_path(job_id, ctx.attempt());
        let output_prefix = OcrHandlerConfig::output_prefix(job_id, ctx.attempt());
        let bucket = &self.config.staging_bucket;
        self.staging
            .upload(bucket, &input_path, &staged, PDF_MIME)
            .await?;
        drop(scratch);
        ctx.report_progress(20, Some("staged"));

        let request = OcrRequest {
            input_uri: format!("gs://{}/{}", bucket, input_path),
            output_uri: format!("gs://{}/{}", bucket, output_prefix),
            mime_type: PDF_MIME.to_string(),
        };
        let text = self.run_operation(ctx, &request).await;

        if self.config.cleanup_staging {
            self.cleanup(job_id, &input_path, &output_prefix).await;
        }

        let text = text?;
        if text.trim().is_empty() {
            return Err(Error::Ocr("OCR produced no text".into()));
        }
        Ok(text)
    }

    fn scratch_file(&self) -> Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ocr-").suffix(".pdf");
        let file = match self.config.scratch_dir {
            Some(ref dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    async fn run_operation(&self, ctx: &JobContext, request: &OcrRequest) -> Result<String> {
        let operation = self.provider.submit(request).await?;
        info!(
            subsystem = "ocr",
            component = "handler",
            job_id = %ctx.job_id(),
            operation = %operation.name,
            "Submitted OCR operation"
        );
        ctx.report_progress(30, Some("submitted"));

        self.wait_for(&operation).await?;
        ctx.report_progress(90, Some("recognized"));
        self.provider.fetch_output(&operation).await
    }

    async fn wait_for(&self, operation: &OcrOperation) -> Result<()> {
        let max_wait = Duration::from_secs(self.config.max_wait_secs);
        let deadline = Instant::now() + max_wait;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match self.provider.poll(operation).await? {
                OperationState::Done => return Ok(()),
                OperationState::Failed(message) => {
                    return Err(Error::Ocr(format!(
                        "OCR operation {} failed: {}",
                        operation.name, message
                    )))
                }
                OperationState::Running => {
                    trace!(operation = %operation.name, "OCR operation still running");
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "OCR operation {} did not finish within {}s",
                    operation.name, self.config.max_wait_secs
                )));
            }
            sleep(poll_interval).await;
        }
    }

    /// Best effort; failures are only logged.
    async fn cleanup(&self, job_id: Uuid, input_path: &str, output_prefix: &str) {
        let bucket = &self.config.staging_bucket;
        let mut paths = vec![input_path.to_string()];
        match self.staging.list(bucket, output_prefix).await {
            Ok(outputs) => paths.extend(outputs),
            Err(e) => warn!(
                subsystem = "ocr",
                component = "handler",
                job_id = %job_id,
                error = %e,
                "Could not list OCR output for cleanup"
            ),
        }
        for path in paths {
            if let Err(e) = self.staging.delete(bucket, &path).await {
                warn!(
                    subsystem = "ocr",
                    component = "handler",
                    job_id = %job_id,
                    path = %path,
                    error = %e,
                    "Could not delete staged object"
                );
            }
        }
    }
}

#[async_trait]
impl JobHandler for OcrHandler {
    fn kind(&self) -> JobKind {
        JobKind::Ocr
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.recognize(&ctx).await.map(JobOutput::Text).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_paths() {
        let id = Uuid::nil();
        assert_eq!(
            OcrHandlerConfig::input_path(id, 1),
            "ocr-input/00000000-0000-0000-0000-000000000000/attempt-1.pdf"
        );
        assert_eq!(
            OcrHandlerConfig::output_prefix(id, 2),
            "ocr-output/00000000-0000-0000-0000-000000000000/attempt-2/"
        );
        // One attempt's prefix must not cover another's.
        assert!(!OcrHandlerConfig::output_prefix(id, 10)
            .starts_with(&OcrHandlerConfig::output_prefix(id, 1)));
    }

    #[test]
    fn test_config_defaults() {
        let config = OcrHandlerConfig::new("vision-staging");
        assert_eq!(config.source_bucket, "documents");
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.max_wait_secs, 600);
        assert!(config.cleanup_staging);
        assert!(config.scratch_dir.is_none());
    }
}
