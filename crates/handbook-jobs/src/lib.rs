//! # handbook-jobs
//!
//! Claim loop and job handlers for the handbook document-processing queue.
//!
//! This crate provides:
//! - A sequential claim loop per job kind (poll, atomic claim, process, finalize)
//! - Per-job timeout, heartbeat and panic isolation
//! - Requeue with exponential back-off for transient failures
//! - A sweeper that requeues jobs abandoned by dead workers
//! - The OCR and Analyze handlers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use handbook_jobs::{AnalyzeHandler, ClaimLoop, WorkerConfig};
//!
//! let handler = AnalyzeHandler::new(documents, backend);
//! let worker = ClaimLoop::new(store, Arc::new(handler), WorkerConfig::from_env());
//!
//! // Start worker and get handle
//! let handle = worker.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.stop().await?;
//! ```

pub mod handler;
pub mod handlers;
pub mod retry;
pub mod sweeper;
pub mod worker;

// Re-export core types
pub use handbook_core::*;

pub use handler::{JobContext, JobHandler, JobResult};
pub use handlers::{AnalyzeHandler, OcrHandler, OcrHandlerConfig};
pub use retry::RetryPolicy;
pub use sweeper::{Sweeper, SweeperConfig, SweeperHandle};
pub use worker::{
    default_worker_id, ClaimLoop, Disposition, LoopStep, Processed, WorkerConfig, WorkerEvent,
    WorkerHandle,
};
