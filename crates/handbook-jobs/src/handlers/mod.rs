//! Handlers for the two job kinds.

pub mod analyze;
pub mod ocr;

pub use analyze::{chunk_text, parse_sections, AnalyzeHandler, AnalyzeInput};
pub use ocr::{OcrHandler, OcrHandlerConfig};
