//! Google Cloud Vision asynchronous PDF OCR.
//!
//! The flow is the long-running `files:asyncBatchAnnotate` operation: submit
//! a staged PDF, poll the operation, then read the JSON shards Vision wrote
//! under the output prefix. Shards are named `output-{start}-to-{end}.json`
//! and are read in page order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, trace};

use handbook_core::defaults::{OCR_BATCH_SIZE, OCR_REQUEST_TIMEOUT_SECS};
use handbook_core::{
    parse_gs_uri, Error, ObjectStore, OcrOperation, OcrProvider, OcrRequest, OperationState,
    Result,
};
use handbook_storage::GoogleTokenSource;

/// Default Vision API endpoint.
pub const DEFAULT_VISION_URL: &str = "https://vision.googleapis.com";

/// Configuration for [`GoogleVisionClient`].
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub token: GoogleTokenSource,
    /// Project billed for the request (`x-goog-user-project`).
    pub quota_project: Option<String>,
    /// Pages per output shard.
    pub batch_size: u32,
    /// Timeout for each individual HTTP request.
    pub timeout_seconds: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_VISION_URL.to_string(),
            token: GoogleTokenSource::None,
            quota_project: None,
            batch_size: OCR_BATCH_SIZE,
            timeout_seconds: OCR_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl VisionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GOOGLE_VISION_BASE_URL` | `https://vision.googleapis.com` | API endpoint |
    /// | `GOOGLE_ACCESS_TOKEN` | (none) | Bearer token, see [`GoogleTokenSource::from_env`] |
    /// | `GOOGLE_CLOUD_PROJECT` | (none) | Quota project |
    /// | `OCR_BATCH_SIZE` | `20` | Pages per output shard |
    /// | `GOOGLE_VISION_TIMEOUT_SECS` | `60` | Per-request timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("GOOGLE_VISION_BASE_URL").unwrap_or(defaults.base_url),
            token: GoogleTokenSource::from_env(),
            quota_project: std::env::var("GOOGLE_CLOUD_PROJECT")
                .ok()
                .filter(|p| !p.trim().is_empty()),
            batch_size: std::env::var("OCR_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| (1..=100).contains(n))
                .unwrap_or(defaults.batch_size),
            timeout_seconds: std::env::var("GOOGLE_VISION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token(mut self, token: GoogleTokenSource) -> Self {
        self.token = token;
        self
    }
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OutputShard {
    #[serde(default)]
    responses: Vec<AnnotateResponse>,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(rename = "fullTextAnnotation")]
    full_text_annotation: Option<FullTextAnnotation>,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
}

/// Google Cloud Vision client implementing [`OcrProvider`].
pub struct GoogleVisionClient {
    client: Client,
    config: VisionConfig,
    /// Store the output shards are read from (the GCS staging bucket).
    output_store: Arc<dyn ObjectStore>,
}

impl GoogleVisionClient {
    pub fn new(config: VisionConfig, output_store: Arc<dyn ObjectStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Ocr(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "ocr",
            component = "vision",
            base_url = %config.base_url,
            output_backend = output_store.backend_name(),
            "Initializing Google Vision client"
        );
        Ok(Self {
            client,
            config,
            output_store,
        })
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn authorize(&self, mut req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        if let Some(token) = self.config.token.bearer(&self.client).await? {
            req = req.bearer_auth(token);
        }
        if let Some(ref project) = self.config.quota_project {
            req = req.header("x-goog-user-project", project);
        }
        Ok(req)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_http_status(
            status.as_u16(),
            format!("{} returned {}: {}", what, status, body),
            Error::Ocr,
        ))
    }
}

static SHARD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"output-(\d+)-to-(\d+)\.json$").unwrap());

/// Starting page encoded in a Vision output shard name.
pub fn shard_start_page(name: &str) -> Option<u32> {
    SHARD_NAME.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Order shard names by starting page, then by name.
///
/// Lexical order would put `output-11-to-20` before `output-2-to-10`.
pub fn sort_shards(names: &mut [String]) {
    names.sort_by(|a, b| {
        shard_start_page(a)
            .unwrap_or(u32::MAX)
            .cmp(&shard_start_page(b).unwrap_or(u32::MAX))
            .then_with(|| a.cmp(b))
    });
}

/// Concatenate the page texts of one shard.
pub fn shard_text(raw: &[u8]) -> Result<Vec<String>> {
    let shard: OutputShard = serde_json::from_slice(raw)
        .map_err(|e| Error::Ocr(format!("Unreadable Vision output shard: {}", e)))?;

    let mut pages = Vec::with_capacity(shard.responses.len());
    for response in shard.responses {
        if let Some(err) = response.error {
            return Err(Error::Ocr(format!(
                "Vision failed on a page ({}): {}",
                err.code, err.message
            )));
        }
        if let Some(annotation) = response.full_text_annotation {
            pages.push(annotation.text);
        }
    }
    Ok(pages)
}

#[async_trait]
impl OcrProvider for GoogleVisionClient {
    async fn submit(&self, request: &OcrRequest) -> Result<OcrOperation> {
        let body = json!({
            "requests": [{
                "inputConfig": {
                    "gcsSource": { "uri": request.input_uri },
                    "mimeType": request.mime_type,
                },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "outputConfig": {
                    "gcsDestination": { "uri": request.output_uri },
                    "batchSize": self.config.batch_size,
                },
            }]
        });

        let req = self.client.post(self.url("files:asyncBatchAnnotate")).json(&body);
        let response = self.authorize(req).await?.send().await?;
        let response = Self::check(response, "Vision asyncBatchAnnotate").await?;
        let operation: OperationResponse = response
            .json()
            .await
            .map_err(|e| Error::Ocr(format!("Unreadable Vision operation: {}", e)))?;

        debug!(
            subsystem = "ocr",
            component = "vision",
            op = "submit",
            operation = %operation.name,
            input = %request.input_uri,
            "Submitted OCR batch"
        );
        Ok(OcrOperation {
            name: operation.name,
            output_uri: request.output_uri.clone(),
        })
    }

    async fn poll(&self, operation: &OcrOperation) -> Result<OperationState> {
        let req = self.client.get(self.url(&operation.name));
        let response = self.authorize(req).await?.send().await?;
        let response = Self::check(response, "Vision operations.get").await?;
        let state: OperationResponse = response
            .json()
            .await
            .map_err(|e| Error::Ocr(format!("Unreadable Vision operation: {}", e)))?;

        trace!(
            subsystem = "ocr",
            component = "vision",
            op = "poll",
            operation = %state.name,
            done = state.done,
            "Polled OCR operation"
        );
        Ok(match (state.done, state.error) {
            (_, Some(err)) => {
                OperationState::Failed(format!("Vision error {}: {}", err.code, err.message))
            }
            (true, None) => OperationState::Done,
            (false, None) => OperationState::Running,
        })
    }

    async fn fetch_output(&self, operation: &OcrOperation) -> Result<String> {
        let (bucket, prefix) = parse_gs_uri(&operation.output_uri).ok_or_else(|| {
            Error::InvalidInput(format!("Not a gs:// URI: {}", operation.output_uri))
        })?;

        let mut shards = self.output_store.list(bucket, prefix).await?;
        shards.retain(|name| name.ends_with(".json"));
        sort_shards(&mut shards);

        let mut pages = Vec::new();
        for shard in &shards {
            let raw = self.output_store.download(bucket, shard).await?;
            pages.extend(shard_text(&raw)?);
        }

        debug!(
            subsystem = "ocr",
            component = "vision",
            op = "fetch_output",
            shards = shards.len(),
            pages = pages.len(),
            "Collected OCR output"
        );
        Ok(pages.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_start_page() {
        assert_eq!(shard_start_page("ocr-output/j/output-1-to-20.json"), Some(1));
        assert_eq!(shard_start_page("output-21-to-25.json"), Some(21));
        assert_eq!(shard_start_page("ocr-output/j/manifest.json"), None);
    }

    #[test]
    fn test_sort_shards_numeric() {
        let mut names = vec![
            "p/output-21-to-30.json".to_string(),
            "p/output-3-to-20.json".to_string(),
            "p/output-1-to-2.json".to_string(),
            "p/other.json".to_string(),
        ];
        sort_shards(&mut names);
        assert_eq!(
            names,
            vec![
                "p/output-1-to-2.json",
                "p/output-3-to-20.json",
                "p/output-21-to-30.json",
                "p/other.json"
            ]
        );
    }

    #[test]
    fn test_shard_text_skips_pages_without_text() {
        let raw = br#"{"responses": [
            {"fullTextAnnotation": {"text": "Regel 1"}},
            {"context": {"pageNumber": 2}},
            {"fullTextAnnotation": {"text": "Regel 2"}}
        ]}"#;
        assert_eq!(shard_text(raw).unwrap(), vec!["Regel 1", "Regel 2"]);
    }

    #[test]
    fn test_shard_text_page_error() {
        let raw = br#"{"responses": [{"error": {"code": 3, "message": "Bad image data"}}]}"#;
        let err = shard_text(raw).unwrap_err();
        assert!(err.to_string().contains("Bad image data"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_url_joins_operation_name() {
        let store: Arc<dyn ObjectStore> = Arc::new(handbook_storage::MemoryObjectStore::new());
        let client = GoogleVisionClient::new(VisionConfig::default(), store).unwrap();
        assert_eq!(
            client.url("operations/123"),
            "https://vision.googleapis.com/v1/operations/123"
        );
        assert_eq!(
            client.url("files:asyncBatchAnnotate"),
            "https://vision.googleapis.com/v1/files:asyncBatchAnnotate"
        );
    }
}
