//! # handbook-storage
//!
//! [`ObjectStore`] implementations used by the workers:
//!
//! - [`SupabaseStorage`]: Supabase Storage REST API (source documents)
//! - [`GcsStorage`]: Google Cloud Storage JSON API (OCR staging and output)
//! - [`FilesystemStore`]: local directory tree, for development
//! - [`MemoryObjectStore`]: in-process map, for tests
//!
//! HTTP failures are mapped with [`Error::from_http_status`], so throttling
//! and server-side failures surface as transient errors and a missing object
//! as [`Error::NotFound`].

pub mod filesystem;
pub mod gcs;
pub mod memory;
pub mod supabase;

pub use handbook_core::{Error, ObjectStore, Result};

pub use filesystem::FilesystemStore;
pub use gcs::{GcsConfig, GcsStorage, GoogleTokenSource, DEFAULT_GCS_URL};
pub use memory::MemoryObjectStore;
pub use supabase::{SupabaseStorage, SupabaseStorageConfig};

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Turn a non-success response into the matching [`Error`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, truncate(&body));
    Err(Error::from_http_status(
        status.as_u16(),
        message,
        Error::Storage,
    ))
}

pub(crate) fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Reject object paths that could escape their bucket.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
        return Err(Error::InvalidInput(format!("Invalid object path: '{}'", path)));
    }
    Ok(())
}
