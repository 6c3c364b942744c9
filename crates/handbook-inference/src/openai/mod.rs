//! OpenAI-compatible chat completion backend.
//!
//! Works with any endpoint that implements `/chat/completions` with
//! `response_format: {"type": "json_object"}`: OpenAI, Azure OpenAI, vLLM,
//! Ollama in compatibility mode.
//!
//! # Example
//!
//! ```rust,no_run
//! use handbook_inference::openai::{OpenAIBackend, OpenAIConfig};
//!
//! let config = OpenAIConfig::default()
//!     .with_base_url("http://localhost:11434/v1")
//!     .with_model("llama3.1");
//! let backend = OpenAIBackend::new(config).unwrap();
//! ```

mod backend;
mod error;
mod types;

pub use backend::{
    OpenAIBackend, OpenAIConfig, DEFAULT_GEN_MODEL, DEFAULT_OPENAI_URL, DEFAULT_TIMEOUT_SECS,
};
pub use error::{to_handbook_error, OpenAIErrorCode};
pub use types::*;
