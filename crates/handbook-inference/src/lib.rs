//! # handbook-inference
//!
//! Clients for the slow external services the workers call.
//!
//! This crate provides:
//! - [`openai::OpenAIBackend`]: OpenAI-compatible chat completions in JSON mode
//! - [`vision::GoogleVisionClient`]: Google Cloud Vision asynchronous PDF OCR
//! - Mock implementations of both (feature `mock`)
//!
//! # Example
//!
//! ```rust,no_run
//! use handbook_core::CompletionBackend;
//! use handbook_inference::openai::OpenAIBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OpenAIBackend::from_env().unwrap();
//!     let json = backend
//!         .complete_json("Svara i JSON.", "Strukturera: Regel 1")
//!         .await
//!         .unwrap();
//!     println!("{}", json);
//! }
//! ```

pub mod openai;
pub mod vision;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use openai::{OpenAIBackend, OpenAIConfig};
pub use vision::{GoogleVisionClient, VisionConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCompletionBackend, MockOcrProvider};
