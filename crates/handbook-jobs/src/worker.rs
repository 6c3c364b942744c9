//! Claim loop: poll, claim, process and finalize jobs of one kind.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use handbook_core::defaults::{
    EVENT_BUS_CAPACITY, JOB_ERROR_BACKOFF_MS, JOB_HEARTBEAT_INTERVAL_SECS, JOB_MAX_ATTEMPTS,
    JOB_POLL_INTERVAL_MS, JOB_RETRY_BASE_DELAY_MS, JOB_RETRY_MAX_DELAY_MS, JOB_TIMEOUT_SECS,
};
use handbook_core::{Error, Job, JobKind, JobOutput, JobStore, Result};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::retry::RetryPolicy;

/// Configuration for a claim loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to `claimed_by`.
    pub worker_id: String,
    /// Sleep when the queue is empty.
    pub poll_interval_ms: u64,
    /// Sleep after a store error or a handler panic.
    pub error_backoff_ms: u64,
    /// Upper bound on one handler run.
    pub job_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Attempts given to newly enqueued jobs.
    pub max_attempts: i32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: JOB_POLL_INTERVAL_MS,
            error_backoff_ms: JOB_ERROR_BACKOFF_MS,
            job_timeout_secs: JOB_TIMEOUT_SECS,
            heartbeat_interval_secs: JOB_HEARTBEAT_INTERVAL_SECS,
            max_attempts: JOB_MAX_ATTEMPTS,
            retry_base_delay_ms: JOB_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: JOB_RETRY_MAX_DELAY_MS,
            enabled: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ID` | `{host}-{pid}-{rand}` | Identity written to `claimed_by` |
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Sleep when the queue is empty |
    /// | `JOB_ERROR_BACKOFF_MS` | `10000` | Sleep after a store error or panic |
    /// | `JOB_TIMEOUT_SECS` | `900` | Bound on one handler run |
    /// | `JOB_HEARTBEAT_INTERVAL_SECS` | `30` | Heartbeat period while processing |
    /// | `JOB_MAX_ATTEMPTS` | `3` | Attempts for new jobs |
    /// | `JOB_RETRY_BASE_DELAY_MS` | `30000` | First retry delay |
    /// | `JOB_RETRY_MAX_DELAY_MS` | `900000` | Retry delay cap |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.worker_id);

        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            worker_id,
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval_ms),
            error_backoff_ms: env_parse("JOB_ERROR_BACKOFF_MS").unwrap_or(defaults.error_backoff_ms),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS").unwrap_or(defaults.job_timeout_secs),
            heartbeat_interval_secs: env_parse("JOB_HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval_secs),
            max_attempts: env_parse::<i32>("JOB_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            retry_base_delay_ms: env_parse("JOB_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("JOB_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry_max_delay_ms),
            enabled,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms.max(base_ms);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// `{hostname}-{pid}-{8 hex chars}`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// Event emitted by the claim loop.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { kind: JobKind, worker_id: String },
    /// A job was claimed and handed to the handler.
    JobStarted { job_id: Uuid, kind: JobKind },
    /// Job progress was reported by the handler.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, kind: JobKind },
    /// A job failed permanently.
    JobFailed {
        job_id: Uuid,
        kind: JobKind,
        error: String,
    },
    /// A job failed transiently and went back to the queue.
    JobRequeued {
        job_id: Uuid,
        kind: JobKind,
        error: String,
        delay: Duration,
    },
    /// Another worker claimed the job first, or took it over mid-run.
    ClaimLost { job_id: Uuid, kind: JobKind },
    /// Worker stopped.
    WorkerStopped { kind: JobKind },
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStep {
    /// No due job.
    Idle,
    /// Another worker claimed the polled job first.
    LostRace(Uuid),
    Completed(Uuid),
    Failed { job_id: Uuid, panicked: bool },
    Requeued { job_id: Uuid, delay: Duration },
    /// The claim was taken away (by the sweeper) before finalize.
    Superseded(Uuid),
    StoreError(String),
}

impl LoopStep {
    /// Pause before the next iteration, if any.
    ///
    /// Every failed attempt, requeued or terminal, is followed by the error
    /// back-off so a broken upstream is not hammered.
    pub fn pause(&self, config: &WorkerConfig) -> Option<Duration> {
        match self {
            LoopStep::Idle => Some(config.poll_interval()),
            LoopStep::StoreError(_) | LoopStep::Failed { .. } | LoopStep::Requeued { .. } => {
                Some(config.error_backoff())
            }
            LoopStep::LostRace(_) | LoopStep::Completed(_) | LoopStep::Superseded(_) => None,
        }
    }
}

/// Result of running the handler on a claimed job.
#[derive(Debug)]
pub struct Processed {
    pub result: JobResult,
    pub panicked: bool,
    /// A heartbeat found the claim gone; the handler was abandoned.
    pub superseded: bool,
    pub duration: Duration,
}

/// Row update chosen for a processed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Complete(JobOutput),
    Fail(String),
    Requeue { error: String, delay: Duration },
}

/// Handle for controlling a running worker.
///
/// Dropping the handle also stops the worker once it is idle.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down after the current job.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))
    }

    /// Signal shutdown and wait for the worker to exit.
    pub async fn stop(self) -> Result<()> {
        // The task may already have exited.
        let _ = self.shutdown().await;
        self.join().await
    }
}

/// Sequential claim loop for one job kind.
pub struct ClaimLoop {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    retry: RetryPolicy,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl ClaimLoop {
    /// Create a claim loop for the handler's job kind.
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let retry = config.retry_policy();
        Self {
            store,
            handler,
            config,
            retry,
            event_tx,
        }
    }

    /// Replace the retry policy derived from the config.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.handler.kind()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Oldest due pending job, without claiming it.
    pub async fn poll_once(&self) -> Result<Option<Job>> {
        self.store.poll_once(self.kind()).await
    }

    /// Claim a polled job. `false` means another worker won.
    pub async fn claim(&self, job_id: Uuid) -> Result<bool> {
        self.store
            .claim(self.kind(), job_id, &self.config.worker_id)
            .await
    }

    /// Run the handler under the job timeout, heartbeating meanwhile.
    ///
    /// Panics and timeouts are converted into results; nothing escapes.
    /// If a heartbeat finds the claim gone, the handler future is dropped
    /// at that point and the result is marked `superseded`.
    pub async fn process(&self, job: &Job) -> Processed {
        let start = Instant::now();
        let job_id = job.id;
        let kind = self.kind();

        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job.clone(), self.config.worker_id.clone())
            .with_progress_callback(move |percent, message| {
                let _ = event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            });

        let job_timeout = self.config.job_timeout();
        let work = tokio::time::timeout(
            job_timeout,
            AssertUnwindSafe(self.handler.execute(ctx)).catch_unwind(),
        );
        tokio::pin!(work);

        let period = self.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (result, panicked, superseded) = loop {
            tokio::select! {
                outcome = &mut work => {
                    break match outcome {
                        Ok(Ok(result)) => (result, false, false),
                        Ok(Err(payload)) => {
                            let message = panic_message(payload.as_ref());
                            error!(
                                subsystem = "jobs",
                                component = "worker",
                                job_id = %job_id,
                                job_kind = %kind,
                                error = %message,
                                "Handler panicked"
                            );
                            (
                                JobResult::Failed(format!("Handler panicked: {}", message)),
                                true,
                                false,
                            )
                        }
                        Err(_) => {
                            warn!(
                                subsystem = "jobs",
                                component = "worker",
                                job_id = %job_id,
                                job_kind = %kind,
                                "Job exceeded timeout of {}s",
                                self.config.job_timeout_secs
                            );
                            (
                                JobResult::Retry(format!(
                                    "Job exceeded timeout of {}s",
                                    self.config.job_timeout_secs
                                )),
                                false,
                                false,
                            )
                        }
                    };
                }
                _ = ticker.tick() => {
                    if !self.beat(job_id).await {
                        break (
                            JobResult::Failed("Claim lost while processing".to_string()),
                            false,
                            true,
                        );
                    }
                }
            }
        };

        Processed {
            result,
            panicked,
            superseded,
            duration: start.elapsed(),
        }
    }

    /// Returns whether the claim is still held.
    async fn beat(&self, job_id: Uuid) -> bool {
        match self
            .store
            .heartbeat(self.kind(), job_id, &self.config.worker_id)
            .await
        {
            Ok(true) => {
                debug!(subsystem = "jobs", component = "worker", job_id = %job_id, "Heartbeat");
                true
            }
            Ok(false) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_kind = %self.kind(),
                    "Lost ownership of job while processing"
                );
                false
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Heartbeat failed"
                );
                true
            }
        }
    }

    /// Map a handler result onto the row update for this attempt.
    pub fn disposition(&self, job: &Job, result: JobResult) -> Disposition {
        match result {
            JobResult::Success(output) if output.is_empty() => {
                Disposition::Fail("Handler produced empty output".to_string())
            }
            JobResult::Success(output) => Disposition::Complete(output),
            JobResult::Failed(error) => Disposition::Fail(error),
            JobResult::Retry(error) if job.has_attempts_left() => Disposition::Requeue {
                error,
                delay: self.retry.delay_for(job.attempt_number()),
            },
            JobResult::Retry(error) => Disposition::Fail(format!(
                "{} (gave up after {} attempts)",
                error,
                job.attempt_number()
            )),
        }
    }

    /// Write the disposition, guarded by this worker's claim.
    ///
    /// Returns `false` when the row is no longer ours; calling it again
    /// after a successful write changes nothing.
    pub async fn finalize(&self, job_id: Uuid, disposition: &Disposition) -> Result<bool> {
        let kind = self.kind();
        let worker_id = &self.config.worker_id;
        match disposition {
            Disposition::Complete(output) => {
                self.store.complete(kind, job_id, worker_id, output).await
            }
            Disposition::Fail(error) => self.store.fail(kind, job_id, worker_id, error).await,
            Disposition::Requeue { error, delay } => {
                self.store
                    .requeue(kind, job_id, worker_id, error, *delay)
                    .await
            }
        }
    }

    /// One iteration: poll, claim, process, finalize.
    pub async fn run_once(&self) -> LoopStep {
        let kind = self.kind();

        let job = match self.poll_once().await {
            Ok(Some(job)) => job,
            Ok(None) => return LoopStep::Idle,
            Err(e) => return self.store_error("poll_once", None, e),
        };
        let job_id = job.id;

        match self.claim(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    subsystem = "jobs",
                    component = "worker",
                    op = "claim",
                    job_id = %job_id,
                    job_kind = %kind,
                    "Claim lost to another worker"
                );
                let _ = self.event_tx.send(WorkerEvent::ClaimLost { job_id, kind });
                return LoopStep::LostRace(job_id);
            }
            Err(e) => return self.store_error("claim", Some(job_id), e),
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job_id,
            job_kind = %kind,
            worker_id = %self.config.worker_id,
            attempt = job.attempt_number(),
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id, kind });

        let processed = self.process(&job).await;
        let duration_ms = processed.duration.as_millis() as u64;
        if processed.superseded {
            warn!(
                subsystem = "jobs",
                component = "worker",
                job_id = %job_id,
                job_kind = %kind,
                duration_ms,
                "Job was reclaimed while processing; handler abandoned"
            );
            let _ = self.event_tx.send(WorkerEvent::ClaimLost { job_id, kind });
            return LoopStep::Superseded(job_id);
        }
        let disposition = self.disposition(&job, processed.result);

        match self.finalize(job_id, &disposition).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    op = "finalize",
                    job_id = %job_id,
                    job_kind = %kind,
                    "Job was reclaimed before finalize; result discarded"
                );
                return LoopStep::Superseded(job_id);
            }
            Err(e) => return self.store_error("finalize", Some(job_id), e),
        }

        match disposition {
            Disposition::Complete(_) => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_kind = %kind,
                    duration_ms,
                    "Job completed successfully"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted { job_id, kind });
                LoopStep::Completed(job_id)
            }
            Disposition::Fail(error) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_kind = %kind,
                    error = %error,
                    duration_ms,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    kind,
                    error,
                });
                LoopStep::Failed {
                    job_id,
                    panicked: processed.panicked,
                }
            }
            Disposition::Requeue { error, delay } => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_kind = %kind,
                    error = %error,
                    transient = true,
                    retry_in_ms = delay.as_millis() as u64,
                    duration_ms,
                    "Job requeued after transient failure"
                );
                let _ = self.event_tx.send(WorkerEvent::JobRequeued {
                    job_id,
                    kind,
                    error,
                    delay,
                });
                LoopStep::Requeued { job_id, delay }
            }
        }
    }

    fn store_error(&self, op: &'static str, job_id: Option<Uuid>, e: Error) -> LoopStep {
        error!(
            subsystem = "jobs",
            component = "worker",
            op,
            job_id = ?job_id,
            job_kind = %self.kind(),
            error = %e,
            "Job store error"
        );
        LoopStep::StoreError(e.to_string())
    }

    /// Run until a shutdown signal arrives.
    ///
    /// A job in progress is always finalized before the loop exits.
    pub async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(job_kind = %self.kind(), "Job worker is disabled, not starting");
            return;
        }

        let kind = self.kind();
        info!(
            subsystem = "jobs",
            component = "worker",
            job_kind = %kind,
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval_ms,
            job_timeout_secs = self.config.job_timeout_secs,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted {
            kind,
            worker_id: self.config.worker_id.clone(),
        });

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(job_kind = %kind, "Job worker received shutdown signal");
                break;
            }

            let step = self.run_once().await;
            if let Some(pause) = step.pause(&self.config) {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(job_kind = %kind, "Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(pause) => {}
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped { kind });
        info!(job_kind = %kind, worker_id = %self.config.worker_id, "Job worker stopped");
    }

    /// Start the loop on its own task and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
