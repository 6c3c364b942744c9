//! In-process job store and document source.
//!
//! Mirrors the conditional-update semantics of [`crate::PgJobStore`] behind a
//! single mutex, so the claim loop can be exercised without PostgreSQL. Every
//! status change is recorded, which lets tests assert on the full sequence a
//! job went through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use handbook_core::{
    Document, DocumentSource, Error, Job, JobKind, JobOutput, JobStatus, JobStore, NewJob,
    QueueStats, Result, SweepReport,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<(JobKind, Uuid), Job>,
    history: HashMap<Uuid, Vec<JobStatus>>,
}

impl Inner {
    fn transition(&mut self, key: (JobKind, Uuid), status: JobStatus, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&key) {
            job.status = status;
            job.updated_at = now;
            self.history.entry(key.1).or_default().push(status);
        }
    }
}

/// In-memory implementation of [`JobStore`].
#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<Inner>>,
    default_max_attempts: i32,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            default_max_attempts: handbook_core::defaults::JOB_MAX_ATTEMPTS,
        }
    }

    /// Override `max_attempts` for jobs enqueued without an explicit value.
    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("Memory job store lock poisoned".into()))
    }

    /// Every status the job has held, in order, starting with `pending`.
    pub fn status_history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.lock()
            .map(|inner| inner.history.get(&job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Move a job's heartbeat (and claim time) into the past.
    pub fn backdate_heartbeat(&self, kind: JobKind, job_id: Uuid, by: Duration) {
        if let Ok(mut inner) = self.lock() {
            if let Some(job) = inner.jobs.get_mut(&(kind, job_id)) {
                let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
                job.heartbeat_at = job.heartbeat_at.map(|t| t - by);
                job.claimed_at = job.claimed_at.map(|t| t - by);
            }
        }
    }

    /// Make a delayed job due immediately.
    pub fn make_due(&self, kind: JobKind, job_id: Uuid) {
        if let Ok(mut inner) = self.lock() {
            if let Some(job) = inner.jobs.get_mut(&(kind, job_id)) {
                job.run_after = Utc::now();
            }
        }
    }

    /// Number of stored jobs of a kind.
    pub fn len(&self, kind: JobKind) -> usize {
        self.lock()
            .map(|inner| inner.jobs.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, kind: JobKind) -> bool {
        self.len(kind) == 0
    }

    fn owned_processing(job: &Job, worker_id: &str) -> bool {
        job.status == JobStatus::Processing && job.claimed_by.as_deref() == Some(worker_id)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<Uuid> {
        if new_job.kind == JobKind::Analyze {
            Uuid::parse_str(&new_job.input_reference).map_err(|e| {
                Error::InvalidInput(format!(
                    "Analyze job needs a document id, got '{}': {}",
                    new_job.input_reference, e
                ))
            })?;
        } else if new_job.input_reference.trim().is_empty() {
            return Err(Error::InvalidInput("OCR job needs a file path".into()));
        }

        let id = Uuid::now_v7();
        let now = Utc::now();
        let job = Job {
            id,
            kind: new_job.kind,
            status: JobStatus::Pending,
            input_reference: new_job.input_reference,
            input_text: new_job.input_text,
            input_metadata: new_job.input_metadata,
            result: None,
            error_message: None,
            last_error: None,
            attempts: 0,
            max_attempts: new_job.max_attempts.unwrap_or(self.default_max_attempts),
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.lock()?;
        inner.history.insert(id, vec![JobStatus::Pending]);
        inner.jobs.insert((new_job.kind, id), job);
        Ok(id)
    }

    async fn get(&self, kind: JobKind, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&(kind, job_id)).cloned())
    }

    async fn poll_once(&self, kind: JobKind) -> Result<Option<Job>> {
        let now = Utc::now();
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.status == JobStatus::Pending && j.run_after <= now)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn claim(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let key = (kind, job_id);
        match inner.jobs.get_mut(&key) {
            Some(job) if job.status == JobStatus::Pending => {
                job.claimed_by = Some(worker_id.to_string());
                job.claimed_at = Some(now);
                job.heartbeat_at = Some(now);
            }
            _ => return Ok(false),
        }
        inner.transition(key, JobStatus::Processing, now);
        Ok(true)
    }

    async fn heartbeat(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&(kind, job_id)) {
            Some(job) if Self::owned_processing(job, worker_id) => {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        output: &JobOutput,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let key = (kind, job_id);
        match inner.jobs.get_mut(&key) {
            Some(job) if Self::owned_processing(job, worker_id) => {
                job.result = Some(output.clone());
                job.error_message = None;
                job.attempts += 1;
                job.heartbeat_at = None;
            }
            _ => return Ok(false),
        }
        inner.transition(key, JobStatus::Done, now);
        Ok(true)
    }

    async fn fail(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let key = (kind, job_id);
        match inner.jobs.get_mut(&key) {
            Some(job) if Self::owned_processing(job, worker_id) => {
                job.result = None;
                job.error_message = Some(error.to_string());
                job.attempts += 1;
                job.heartbeat_at = None;
            }
            _ => return Ok(false),
        }
        inner.transition(key, JobStatus::Error, now);
        Ok(true)
    }

    async fn requeue(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let key = (kind, job_id);
        match inner.jobs.get_mut(&key) {
            Some(job) if Self::owned_processing(job, worker_id) => {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.run_after =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                job.claimed_by = None;
                job.claimed_at = None;
                job.heartbeat_at = None;
            }
            _ => return Ok(false),
        }
        inner.transition(key, JobStatus::Pending, now);
        Ok(true)
    }

    async fn requeue_stale(&self, kind: JobKind, stale_after: Duration) -> Result<SweepReport> {
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let mut inner = self.lock()?;

        let stale: Vec<(Uuid, bool)> = inner
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.status == JobStatus::Processing)
            .filter(|j| j.heartbeat_at.or(j.claimed_at).unwrap_or(j.updated_at) < cutoff)
            .map(|j| (j.id, j.attempts + 1 >= j.max_attempts))
            .collect();

        let mut report = SweepReport::default();
        for (id, exhausted) in stale {
            let key = (kind, id);
            let Some(job) = inner.jobs.get_mut(&key) else {
                continue;
            };
            let owner = job.claimed_by.clone().unwrap_or_else(|| "unknown".into());
            job.attempts += 1;
            job.heartbeat_at = None;
            if exhausted {
                job.result = None;
                job.error_message = Some(format!(
                    "Abandoned by worker {} after {} attempt(s)",
                    owner, job.attempts
                ));
                inner.transition(key, JobStatus::Error, now);
                report.abandoned += 1;
            } else {
                job.last_error = Some(format!("Worker {} stopped sending heartbeats", owner));
                job.claimed_by = None;
                job.claimed_at = None;
                job.run_after = now;
                inner.transition(key, JobStatus::Pending, now);
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn reset(&self, kind: JobKind, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let key = (kind, job_id);
        match inner.jobs.get_mut(&key) {
            Some(job) if job.status == JobStatus::Error => {
                job.result = None;
                job.error_message = None;
                job.last_error = None;
                job.attempts = 0;
                job.claimed_by = None;
                job.claimed_at = None;
                job.heartbeat_at = None;
                job.run_after = now;
            }
            _ => return Ok(false),
        }
        inner.transition(key, JobStatus::Pending, now);
        Ok(true)
    }

    async fn stats(&self, kind: JobKind) -> Result<QueueStats> {
        let inner = self.lock()?;
        let mut stats = QueueStats::default();
        for job in inner.jobs.values().filter(|j| j.kind == kind) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Error => stats.error += 1,
            }
        }
        Ok(stats)
    }
}

/// In-memory implementation of [`DocumentSource`].
#[derive(Clone, Default)]
pub struct MemoryDocumentSource {
    documents: Arc<Mutex<HashMap<Uuid, Document>>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document and return its id.
    pub fn insert(&self, document: Document) -> Uuid {
        let id = document.id;
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(id, document);
        }
        id
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>> {
        let docs = self
            .documents
            .lock()
            .map_err(|_| Error::Internal("Memory document source lock poisoned".into()))?;
        Ok(docs.get(&document_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKER: &str = "worker-a";

    #[tokio::test]
    async fn test_poll_once_is_fifo_and_kind_scoped() {
        let store = MemoryJobStore::new();
        let first = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        let _second = store.enqueue(NewJob::ocr("b.pdf")).await.unwrap();
        store
            .enqueue(NewJob::analyze(Uuid::new_v4()))
            .await
            .unwrap();

        let polled = store.poll_once(JobKind::Ocr).await.unwrap().unwrap();
        assert_eq!(polled.id, first);
        assert_eq!(polled.kind, JobKind::Ocr);

        let analyze = store.poll_once(JobKind::Analyze).await.unwrap().unwrap();
        assert_eq!(analyze.kind, JobKind::Analyze);
    }

    #[tokio::test]
    async fn test_poll_once_empty_queue() {
        let store = MemoryJobStore::new();
        assert!(store.poll_once(JobKind::Ocr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();

        assert!(store.claim(JobKind::Ocr, id, "w1").await.unwrap());
        assert!(!store.claim(JobKind::Ocr, id, "w2").await.unwrap());

        let job = store.get(JobKind::Ocr, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.claimed_by.as_deref(), Some("w1"));
        assert!(job.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_wrong_kind_fails() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        assert!(!store.claim(JobKind::Analyze, id, WORKER).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        store.claim(JobKind::Ocr, id, WORKER).await.unwrap();

        let output = JobOutput::Text("Regel 1".into());
        assert!(store.complete(JobKind::Ocr, id, WORKER, &output).await.unwrap());
        let after_first = store.get(JobKind::Ocr, id).await.unwrap().unwrap();

        assert!(!store.complete(JobKind::Ocr, id, WORKER, &output).await.unwrap());
        let after_second = store.get(JobKind::Ocr, id).await.unwrap().unwrap();

        assert_eq!(after_first.status, JobStatus::Done);
        assert_eq!(after_second.status, JobStatus::Done);
        assert_eq!(after_first.result, after_second.result);
        assert_eq!(after_first.attempts, after_second.attempts);
        assert_eq!(after_first.updated_at, after_second.updated_at);
        assert_eq!(
            store.status_history(id),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Done]
        );
    }

    #[tokio::test]
    async fn test_fail_sets_error_and_clears_result() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        store.claim(JobKind::Ocr, id, WORKER).await.unwrap();
        assert!(store.fail(JobKind::Ocr, id, WORKER, "boom").await.unwrap());

        let job = store.get(JobKind::Ocr, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_finalize_requires_ownership() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        store.claim(JobKind::Ocr, id, "w1").await.unwrap();

        let output = JobOutput::Text("x".into());
        assert!(!store.complete(JobKind::Ocr, id, "w2", &output).await.unwrap());
        assert!(!store.fail(JobKind::Ocr, id, "w2", "nope").await.unwrap());
        assert!(!store.heartbeat(JobKind::Ocr, id, "w2").await.unwrap());
        assert!(store.heartbeat(JobKind::Ocr, id, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_delays_and_counts_attempt() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        store.claim(JobKind::Ocr, id, WORKER).await.unwrap();
        assert!(store
            .requeue(JobKind::Ocr, id, WORKER, "503", Duration::from_secs(60))
            .await
            .unwrap());

        let job = store.get(JobKind::Ocr, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("503"));
        assert!(job.error_message.is_none());
        assert!(job.claimed_by.is_none());

        // Not due yet.
        assert!(store.poll_once(JobKind::Ocr).await.unwrap().is_none());
        store.make_due(JobKind::Ocr, id);
        assert_eq!(store.poll_once(JobKind::Ocr).await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_requeue_stale_requeues_and_abandons() {
        let store = MemoryJobStore::new();
        let retryable = store
            .enqueue(NewJob::ocr("a.pdf").with_max_attempts(3))
            .await
            .unwrap();
        let exhausted = store
            .enqueue(NewJob::ocr("b.pdf").with_max_attempts(1))
            .await
            .unwrap();
        let fresh = store.enqueue(NewJob::ocr("c.pdf")).await.unwrap();

        for id in [retryable, exhausted, fresh] {
            store.claim(JobKind::Ocr, id, WORKER).await.unwrap();
        }
        store.backdate_heartbeat(JobKind::Ocr, retryable, Duration::from_secs(600));
        store.backdate_heartbeat(JobKind::Ocr, exhausted, Duration::from_secs(600));

        let report = store
            .requeue_stale(JobKind::Ocr, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.abandoned, 1);

        let job = store.get(JobKind::Ocr, retryable).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains(WORKER));

        let job = store.get(JobKind::Ocr, exhausted).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().contains("Abandoned"));

        let job = store.get(JobKind::Ocr, fresh).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_reset_only_from_error() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        assert!(!store.reset(JobKind::Ocr, id).await.unwrap());

        store.claim(JobKind::Ocr, id, WORKER).await.unwrap();
        store.fail(JobKind::Ocr, id, WORKER, "bad").await.unwrap();
        assert!(store.reset(JobKind::Ocr, id).await.unwrap());

        let job = store.get(JobKind::Ocr, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_validates_reference() {
        let store = MemoryJobStore::new();
        let err = store
            .enqueue(NewJob {
                kind: JobKind::Analyze,
                input_reference: "not-a-uuid".into(),
                input_text: None,
                input_metadata: None,
                max_attempts: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.enqueue(NewJob::ocr("  ")).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = MemoryJobStore::new();
        let a = store.enqueue(NewJob::ocr("a.pdf")).await.unwrap();
        store.enqueue(NewJob::ocr("b.pdf")).await.unwrap();
        store.claim(JobKind::Ocr, a, WORKER).await.unwrap();

        let stats = store.stats(JobKind::Ocr).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 2);
        assert_eq!(store.stats(JobKind::Analyze).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_memory_document_source() {
        let docs = MemoryDocumentSource::new();
        let id = docs.insert(Document {
            id: Uuid::new_v4(),
            file_name: Some("ordningsregler.pdf".into()),
            extracted_text: Some("Regel 1".into()),
            metadata: None,
        });
        let doc = docs.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.file_name.as_deref(), Some("ordningsregler.pdf"));
        assert!(docs.get_document(Uuid::new_v4()).await.unwrap().is_none());
    }
}
