//! Structured logging field names shared by every crate.
//!
//! Use these constants as field keys so log aggregation can query the same
//! names across the store, the service clients and the claim loop.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Job store unreachable, handler panicked, requires operator attention |
//! | WARN  | Job failed or was requeued, stale job swept |
//! | INFO  | Worker lifecycle, job claimed, job completed |
//! | DEBUG | Poll results, external call boundaries, config choices |
//! | TRACE | Per-page and per-chunk iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "storage", "inference", "ocr", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "sweeper", "pool", "vision", "openai", "supabase"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "poll_once", "claim", "finalize", "submit", "complete_json"
pub const OPERATION: &str = "op";

/// Identifier of the worker process that owns a claim.
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job kind ("ocr" or "analyze").
pub const JOB_KIND: &str = "job_kind";

/// Object storage bucket.
pub const BUCKET: &str = "bucket";

/// Object storage path or key.
pub const OBJECT_PATH: &str = "path";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number of the job (1-based).
pub const ATTEMPT: &str = "attempt";

/// Byte length of a downloaded or uploaded object.
pub const BYTES: &str = "bytes";

/// Byte length of a prompt.
pub const PROMPT_LEN: &str = "prompt_len";

/// Byte length of a model response.
pub const RESPONSE_LEN: &str = "response_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Whether a failure was classified as transient.
pub const TRANSIENT: &str = "transient";
