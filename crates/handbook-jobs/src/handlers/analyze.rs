//! Analyze job handler: document text in, handbook sections out.
//!
//! The text is split into chunks on line boundaries, each chunk is sent to
//! the completion backend as a JSON-mode request, and the sections from all
//! chunks are merged in order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, trace};
use uuid::Uuid;

use handbook_core::defaults::ANALYZE_CHUNK_SIZE;
use handbook_core::{CompletionBackend, DocumentSource, Error, Job, JobKind, JobOutput, Result};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Fixed system instruction for every chunk.
pub const SYSTEM_PROMPT: &str = "Du är en expert handboksförfattare som skapar digitala handböcker. \
Din uppgift är att analysera ett dokument och strukturera det för att skapa en användbar digital handbok.

Returnera ENDAST giltig JSON i formatet:
{\"sections\": [{\"title\": \"Sektionstitel\", \"content\": \"Innehåll\", \"confidence\": 0.9}]}
Varje sektion ska ha title, content och confidence (0-1). Behåll all information.";

const UNTITLED: &str = "Namnlöst dokument";

/// Text and context to analyze.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeInput {
    pub file_name: String,
    pub metadata: JsonValue,
    pub text: String,
}

/// Handler for analyze jobs.
pub struct AnalyzeHandler {
    documents: Arc<dyn DocumentSource>,
    backend: Arc<dyn CompletionBackend>,
    chunk_size: usize,
}

impl AnalyzeHandler {
    pub fn new(documents: Arc<dyn DocumentSource>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            documents,
            backend,
            chunk_size: ANALYZE_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = chars.max(1);
        self
    }

    /// Inline input wins over the `document_imports` row.
    pub async fn load_input(&self, job: &Job) -> Result<AnalyzeInput> {
        if let Some(ref text) = job.input_text {
            let metadata = job.input_metadata.clone().unwrap_or_else(|| json!({}));
            let file_name = metadata
                .get("file_name")
                .and_then(JsonValue::as_str)
                .unwrap_or(UNTITLED)
                .to_string();
            return Ok(AnalyzeInput {
                file_name,
                metadata,
                text: text.clone(),
            });
        }

        let document_id = Uuid::parse_str(job.input_reference.trim()).map_err(|e| {
            Error::InvalidInput(format!(
                "Invalid document_id '{}': {}",
                job.input_reference, e
            ))
        })?;
        let document = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Document {} not found", document_id)))?;
        let text = document
            .extracted_text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidInput(format!("Document {} has no extracted text", document_id))
            })?;

        Ok(AnalyzeInput {
            file_name: document.file_name.unwrap_or_else(|| UNTITLED.to_string()),
            metadata: document.metadata.unwrap_or_else(|| json!({})),
            text,
        })
    }

    async fn analyze(&self, ctx: &JobContext) -> Result<JsonValue> {
        let job_id = ctx.job_id();
        let input = self.load_input(&ctx.job).await?;
        let chunks = chunk_text(&input.text, self.chunk_size);
        if chunks.is_empty() {
            return Err(Error::InvalidInput("Document text is empty".into()));
        }
        info!(
            subsystem = "inference",
            component = "analyze",
            job_id = %job_id,
            chunks = chunks.len(),
            model = self.backend.model_name(),
            "Analyzing document"
        );

        let total = chunks.len();
        let mut sections = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let prompt = user_prompt(&input, i + 1, total, chunk);
            let response = self.backend.complete_json(SYSTEM_PROMPT, &prompt).await?;
            debug!(
                subsystem = "inference",
                component = "analyze",
                job_id = %job_id,
                part = i + 1,
                prompt_len = prompt.len(),
                response_len = response.len(),
                "Chunk analyzed"
            );
            let found = parse_sections(&response)?;
            trace!(part = i + 1, sections = found.len(), "Parsed sections");
            sections.extend(found);
            ctx.report_progress(((i + 1) * 100 / total) as i32, None);
        }

        if sections.is_empty() {
            return Err(Error::Inference("no valid section found".into()));
        }
        Ok(json!({ "sections": sections, "chunks": total }))
    }
}

#[async_trait]
impl JobHandler for AnalyzeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Analyze
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.analyze(&ctx).await.map(JobOutput::Json).into()
    }
}

/// User prompt for one chunk.
pub fn user_prompt(input: &AnalyzeInput, part: usize, total: usize, chunk: &str) -> String {
    format!(
        "Analysera dokumentet nedan och skapa sektioner som är logiska och användbara för läsare \
         av en digital handbok. Detta är del {} av {}.\n\n\
         DOKUMENTINFORMATION:\n- Titel: {}\n- Metadata: {}\n\nDOKUMENT:\n{}",
        part, total, input.file_name, input.metadata, chunk
    )
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Chunks break between lines; a line longer than `max_chars` is split hard.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        for piece in split_long_line(line, max) {
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + 1 + piece_len > max {
                push_trimmed(&mut chunks, &current);
                current.clear();
                current_len = 0;
            }
            if current_len > 0 {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(piece);
            current_len += piece_len;
        }
    }
    push_trimmed(&mut chunks, &current);
    chunks
}

fn split_long_line(line: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.chars().count() > max {
        let cut = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}

fn push_trimmed(chunks: &mut Vec<String>, chunk: &str) {
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Parse one model response into its valid sections.
///
/// Accepts `{"sections": [...]}` or a bare array, optionally inside a
/// markdown code fence.
pub fn parse_sections(response: &str) -> Result<Vec<JsonValue>> {
    let body = strip_code_fence(response.trim());
    if body.is_empty() {
        return Err(Error::Inference("empty response from model".into()));
    }
    let value: JsonValue = serde_json::from_str(body).map_err(|e| {
        Error::Serialization(format!("could not parse model response as JSON: {}", e))
    })?;

    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("sections") {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(items.into_iter().filter(is_valid_section).collect())
}

fn strip_code_fence(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn is_valid_section(section: &JsonValue) -> bool {
    let title = section.get("title").and_then(JsonValue::as_str);
    let content = section.get("content").and_then(JsonValue::as_str);
    matches!((title, content), (Some(t), Some(_)) if !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_short_text_is_one_chunk() {
        let chunks = chunk_text("Regel 1: Inga husdjur.\nRegel 2: Tyst efter 22.", 2500);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with("Regel 1"));
    }

    #[test]
    fn test_chunk_breaks_on_lines() {
        let line = "a".repeat(2000);
        let text = format!("{}\n{}\n{}", line, line, line);
        let chunks = chunk_text(&text, 2500);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c == &line));
    }

    #[test]
    fn test_chunk_hard_splits_long_line() {
        let text = "å".repeat(6000);
        let chunks = chunk_text(&text, 2500);
        let lens: Vec<usize> = chunks.iter().map(|c| c.chars().count()).collect();
        assert_eq!(lens, vec![2500, 2500, 1000]);
    }

    #[test]
    fn test_chunk_never_exceeds_limit() {
        let text = (0..500)
            .map(|i| format!("Rad {} med lite text om föreningens regler", i))
            .collect::<Vec<_>>()
            .join("\n");
        for chunk in chunk_text(&text, 300) {
            assert!(chunk.chars().count() <= 300);
        }
    }

    #[test]
    fn test_chunk_blank_text() {
        assert!(chunk_text("  \n\n \n", 2500).is_empty());
    }

    #[test]
    fn test_parse_sections_object_and_array() {
        let obj = r#"{"sections": [{"title": "Regler", "content": "Inga husdjur", "confidence": 0.9}]}"#;
        assert_eq!(parse_sections(obj).unwrap().len(), 1);

        let arr = r#"[{"title": "A", "content": "x"}, {"title": "B", "content": "y"}]"#;
        assert_eq!(parse_sections(arr).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_sections_drops_invalid_entries() {
        let body = r#"{"sections": [{"title": "", "content": "x"}, {"content": "y"}, "text", {"title": "Ok", "content": ""}]}"#;
        let sections = parse_sections(body).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0]["title"], "Ok");
    }

    #[test]
    fn test_parse_sections_code_fence() {
        let body = "```json\n{\"sections\": [{\"title\": \"A\", \"content\": \"x\"}]}\n```";
        assert_eq!(parse_sections(body).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_sections_errors() {
        let err = parse_sections("   ").unwrap_err();
        assert!(err.to_string().contains("empty response from model"));
        assert!(!err.is_transient());

        let err = parse_sections("not json").unwrap_err();
        assert!(err
            .to_string()
            .contains("could not parse model response as JSON"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_user_prompt_embeds_context() {
        let input = AnalyzeInput {
            file_name: "ordningsregler.pdf".into(),
            metadata: json!({"pages": 2}),
            text: String::new(),
        };
        let prompt = user_prompt(&input, 1, 2, "Regel 1");
        assert!(prompt.contains("del 1 av 2"));
        assert!(prompt.contains("- Titel: ordningsregler.pdf"));
        assert!(prompt.contains(r#"- Metadata: {"pages":2}"#));
        assert!(prompt.ends_with("DOKUMENT:\nRegel 1"));
    }
}
