//! # handbook-core
//!
//! Core types, traits, and abstractions for the handbook document-processing
//! job queue.
//!
//! This crate provides the data model shared by the job store, the external
//! service clients and the claim loop, plus the trait seams between them.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
