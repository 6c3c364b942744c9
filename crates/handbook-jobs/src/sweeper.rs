//! Stale-job sweeper.
//!
//! A worker that dies mid-job leaves its row in `processing`. The sweeper
//! runs next to the claim loop and hands such rows back to the queue once
//! their heartbeat is older than `stale_after`, or fails them when they have
//! used up their attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use handbook_core::defaults::{JOB_STALE_AFTER_SECS, JOB_SWEEP_INTERVAL_SECS};
use handbook_core::{Error, JobKind, JobStore, Result, SweepReport};

/// Configuration for the stale-job sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Heartbeat age after which a `processing` job counts as abandoned.
    pub stale_after_secs: u64,
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: JOB_SWEEP_INTERVAL_SECS,
            stale_after_secs: JOB_STALE_AFTER_SECS,
            enabled: true,
        }
    }
}

impl SweeperConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_SWEEPER_ENABLED` | `true` | Run the sweeper in this process |
    /// | `JOB_SWEEP_INTERVAL_SECS` | `60` | Time between sweeps |
    /// | `JOB_STALE_AFTER_SECS` | `300` | Heartbeat age that marks a job abandoned |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_SWEEPER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let interval_secs = std::env::var("JOB_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_SWEEP_INTERVAL_SECS);
        let stale_after_secs = std::env::var("JOB_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_STALE_AFTER_SECS);

        Self {
            interval_secs,
            stale_after_secs,
            enabled,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_stale_after(mut self, secs: u64) -> Self {
        self.stale_after_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Periodically requeues abandoned jobs of one kind.
pub struct Sweeper {
    store: Arc<dyn JobStore>,
    kind: JobKind,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn JobStore>, kind: JobKind, config: SweeperConfig) -> Self {
        Self {
            store,
            kind,
            config,
        }
    }

    /// Warn when the stale threshold would catch live workers.
    pub fn check_against_heartbeat(&self, heartbeat_interval: Duration) {
        if self.config.stale_after() < heartbeat_interval * 2 {
            warn!(
                subsystem = "jobs",
                component = "sweeper",
                stale_after_secs = self.config.stale_after_secs,
                heartbeat_interval_secs = heartbeat_interval.as_secs(),
                "Stale threshold is below two heartbeat intervals; live jobs may be requeued"
            );
        }
    }

    /// Run one sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let report = self
            .store
            .requeue_stale(self.kind, self.config.stale_after())
            .await?;

        if report.requeued > 0 || report.abandoned > 0 {
            warn!(
                subsystem = "jobs",
                component = "sweeper",
                job_kind = %self.kind,
                requeued = report.requeued,
                abandoned = report.abandoned,
                "Swept stale jobs"
            );
        } else {
            debug!(
                subsystem = "jobs",
                component = "sweeper",
                job_kind = %self.kind,
                "No stale jobs"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until a shutdown signal arrives.
    pub async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(job_kind = %self.kind, "Stale-job sweeper is disabled");
            return;
        }
        info!(
            subsystem = "jobs",
            component = "sweeper",
            job_kind = %self.kind,
            interval_secs = self.config.interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            "Stale-job sweeper started"
        );

        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(
                            subsystem = "jobs",
                            component = "sweeper",
                            job_kind = %self.kind,
                            error = %e,
                            "Sweep failed"
                        );
                    }
                }
            }
        }
        info!(job_kind = %self.kind, "Stale-job sweeper stopped");
    }

    /// Start the sweeper on its own task.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        SweeperHandle { shutdown_tx, join }
    }
}

/// Handle for a running sweeper.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the sweeper to exit.
    pub async fn stop(self) -> Result<()> {
        // The task may already have exited.
        let _ = self.shutdown_tx.send(()).await;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Sweeper task failed: {}", e)))
    }
}
