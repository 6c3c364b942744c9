//! # handbook-worker
//!
//! Process wiring for the `ocr-worker` and `analyze-worker` binaries: logging,
//! configuration from the environment, service construction and shutdown.
//!
//! Each process runs one claim loop and one stale-job sweeper for its kind.

pub mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use handbook_core::{JobKind, JobStore, ObjectStore};
use handbook_db::{Database, PoolConfig};
use handbook_inference::{GoogleVisionClient, OpenAIBackend, OpenAIConfig, VisionConfig};
use handbook_jobs::{
    AnalyzeHandler, ClaimLoop, JobHandler, OcrHandler, OcrHandlerConfig, Sweeper, SweeperConfig,
    WorkerConfig,
};
use handbook_storage::{FilesystemStore, GcsStorage, SupabaseStorage};

pub use logging::{init_tracing, LogConfig};

/// Where the OCR worker reads source documents from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceBackend {
    Supabase,
    /// Local directory laid out as `{root}/{bucket}/{path}`.
    Filesystem(PathBuf),
}

impl SourceBackend {
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STORAGE_BACKEND` | `supabase` | `supabase` or `filesystem` |
    /// | `STORAGE_ROOT` | `./storage` | Root directory for `filesystem` |
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "supabase".into());
        match backend.trim().to_ascii_lowercase().as_str() {
            "supabase" | "" => Ok(Self::Supabase),
            "filesystem" | "fs" => Ok(Self::Filesystem(
                std::env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./storage")),
            )),
            other => anyhow::bail!("Unknown STORAGE_BACKEND '{}'", other),
        }
    }

    pub fn build(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            Self::Supabase => Arc::new(
                SupabaseStorage::from_env().context("configuring Supabase storage")?,
            ),
            Self::Filesystem(root) => Arc::new(FilesystemStore::new(root.clone())),
        })
    }
}

/// Handler for OCR jobs backed by Google Cloud Vision.
pub fn build_ocr_handler() -> anyhow::Result<Arc<dyn JobHandler>> {
    let config = OcrHandlerConfig::from_env().context("configuring OCR handler")?;
    let source = SourceBackend::from_env()?.build()?;

    let gcs = GcsStorage::from_env().context("configuring Google Cloud Storage")?;
    let staging: Arc<dyn ObjectStore> = Arc::new(gcs);
    let vision = GoogleVisionClient::new(VisionConfig::from_env(), staging.clone())
        .context("configuring Google Cloud Vision")?;

    info!(
        subsystem = "ocr",
        source = source.backend_name(),
        source_bucket = %config.source_bucket,
        staging_bucket = %config.staging_bucket,
        "OCR handler configured"
    );
    Ok(Arc::new(OcrHandler::new(
        source,
        staging,
        Arc::new(vision),
        config,
    )))
}

/// Handler for analyze jobs backed by an OpenAI-compatible API.
pub fn build_analyze_handler(db: &Database) -> anyhow::Result<Arc<dyn JobHandler>> {
    let config = OpenAIConfig::from_env();
    if config.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; requests are sent without credentials");
    }
    let backend = OpenAIBackend::new(config).context("configuring completion backend")?;
    info!(
        subsystem = "inference",
        model = %backend.config().gen_model,
        "Analyze handler configured"
    );
    Ok(Arc::new(AnalyzeHandler::new(
        Arc::new(db.documents.clone()),
        Arc::new(backend),
    )))
}

/// Connect to the job database.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `DATABASE_URL` | required | PostgreSQL connection string |
/// | `RUN_MIGRATIONS` | `false` | Apply migrations at startup |
pub async fn connect_database(max_attempts: i32) -> anyhow::Result<Database> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let db = Database::connect_with_config(&url, PoolConfig::from_env())
        .await
        .context("connecting to database")?
        .with_default_max_attempts(max_attempts);

    let migrate = std::env::var("RUN_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if migrate {
        db.migrate().await.context("running migrations")?;
        info!("Database migrations applied");
    }
    Ok(db)
}

/// Run a worker process for `kind` until Ctrl-C or SIGTERM.
pub async fn run_worker(kind: JobKind) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_config = LogConfig::from_env();
    let _log_guard = init_tracing(&log_config, &format!("{}-worker.log", kind));
    info!(
        job_kind = %kind,
        json = log_config.json,
        log_file = log_config.file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let worker_config = WorkerConfig::from_env();
    let sweeper_config = SweeperConfig::from_env();
    let db = connect_database(worker_config.max_attempts).await?;

    let handler = match kind {
        JobKind::Ocr => build_ocr_handler()?,
        JobKind::Analyze => build_analyze_handler(&db)?,
    };
    let store: Arc<dyn JobStore> = Arc::new(db.jobs.clone());

    let sweeper = Sweeper::new(store.clone(), kind, sweeper_config);
    sweeper.check_against_heartbeat(worker_config.heartbeat_interval());
    let sweeper = sweeper.start();
    let worker = ClaimLoop::new(store, handler, worker_config).start();

    shutdown_signal().await;
    info!(job_kind = %kind, "Shutdown requested; finishing current job");

    worker.stop().await?;
    sweeper.stop().await?;
    info!(job_kind = %kind, "Worker exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
