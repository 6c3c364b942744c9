//! Centralized default constants for the handbook job queue.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs in the other crates start from these and let environment
//! variables override them.

// =============================================================================
// CLAIM LOOP
// =============================================================================

/// Sleep between polls when the queue is empty, in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Back-off after a handler panic or a job store failure, in milliseconds.
pub const JOB_ERROR_BACKOFF_MS: u64 = 10_000;

/// Upper bound for a single job's processing, in seconds (15 minutes).
///
/// OCR of a long scanned PDF routinely takes several minutes on the provider.
pub const JOB_TIMEOUT_SECS: u64 = 900;

/// Interval at which the owning worker refreshes `heartbeat_at`, in seconds.
pub const JOB_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Attempts allowed per job before a transient failure becomes terminal.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// First retry delay for transient failures, in milliseconds.
pub const JOB_RETRY_BASE_DELAY_MS: u64 = 30_000;

/// Cap on the exponential retry delay, in milliseconds (15 minutes).
pub const JOB_RETRY_MAX_DELAY_MS: u64 = 900_000;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// STALE JOB SWEEPER
// =============================================================================

/// How often the sweeper looks for abandoned jobs, in seconds.
pub const JOB_SWEEP_INTERVAL_SECS: u64 = 60;

/// Age of `heartbeat_at` after which a `processing` job counts as abandoned.
///
/// Ten missed heartbeats at the default interval.
pub const JOB_STALE_AFTER_SECS: u64 = 300;

// =============================================================================
// OCR
// =============================================================================

/// Bucket holding uploaded source documents.
pub const SOURCE_BUCKET: &str = "documents";

/// Object prefix for staged OCR input files.
pub const OCR_INPUT_PREFIX: &str = "ocr-input";

/// Object prefix for OCR provider output files.
pub const OCR_OUTPUT_PREFIX: &str = "ocr-output";

/// Interval between OCR operation status checks, in milliseconds.
pub const OCR_POLL_INTERVAL_MS: u64 = 5_000;

/// Maximum wait for one OCR operation, in seconds.
pub const OCR_MAX_WAIT_SECS: u64 = 600;

/// Pages per output file requested from the OCR provider.
pub const OCR_BATCH_SIZE: u32 = 20;

// =============================================================================
// ANALYZE
// =============================================================================

/// Maximum characters of document text sent to the model per request.
pub const ANALYZE_CHUNK_SIZE: usize = 2_500;

/// Sampling temperature for structure analysis.
pub const ANALYZE_TEMPERATURE: f32 = 0.1;

/// Token budget for one structure analysis response.
pub const ANALYZE_MAX_TOKENS: u32 = 8_000;

// =============================================================================
// HTTP
// =============================================================================

/// Timeout for object storage requests in seconds.
pub const STORAGE_TIMEOUT_SECS: u64 = 120;

/// Timeout for generation requests in seconds.
pub const GEN_TIMEOUT_SECS: u64 = 300;

/// Timeout for OCR provider API calls (not the whole operation) in seconds.
pub const OCR_REQUEST_TIMEOUT_SECS: u64 = 60;
