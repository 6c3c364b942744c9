//! Google Cloud Storage over the JSON API.
//!
//! Used for the OCR staging bucket: the PDF is uploaded under `ocr-input/`
//! and Vision writes its JSON results under `ocr-output/`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use handbook_core::defaults::STORAGE_TIMEOUT_SECS;
use handbook_core::{Error, ObjectStore, Result};

use crate::{check_status, validate_path};

/// Default Cloud Storage endpoint.
pub const DEFAULT_GCS_URL: &str = "https://storage.googleapis.com";

/// Default metadata server host on Google Cloud compute.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Refresh metadata-server tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Where Google API bearer tokens come from.
#[derive(Clone)]
pub enum GoogleTokenSource {
    /// No `Authorization` header (emulators, tests).
    None,
    /// A fixed token, e.g. from `gcloud auth print-access-token`.
    Static(String),
    /// The compute metadata server, cached until shortly before expiry.
    MetadataServer {
        host: String,
        cache: Arc<Mutex<Option<(String, Instant)>>>,
    },
}

impl std::fmt::Debug for GoogleTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static(_) => f.write_str("Static(***)"),
            Self::MetadataServer { host, .. } => write!(f, "MetadataServer({})", host),
        }
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl GoogleTokenSource {
    /// Resolve the token source from the environment.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `GOOGLE_ACCESS_TOKEN` | Static bearer token |
    /// | `GOOGLE_USE_METADATA_SERVER` | `true` to fetch tokens from the metadata server |
    /// | `GCE_METADATA_HOST` | Metadata server host override |
    pub fn from_env() -> Self {
        if let Ok(token) = std::env::var("GOOGLE_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Self::Static(token.trim().to_string());
            }
        }

        let use_metadata = std::env::var("GOOGLE_USE_METADATA_SERVER")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if use_metadata {
            return Self::metadata_server(
                std::env::var("GCE_METADATA_HOST")
                    .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string()),
            );
        }

        Self::None
    }

    pub fn metadata_server(host: impl Into<String>) -> Self {
        Self::MetadataServer {
            host: host.into(),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Current bearer token, if any.
    pub async fn bearer(&self, client: &Client) -> Result<Option<String>> {
        match self {
            Self::None => Ok(None),
            Self::Static(token) => Ok(Some(token.clone())),
            Self::MetadataServer { host, cache } => {
                let mut cached = cache.lock().await;
                if let Some((token, expires_at)) = cached.as_ref() {
                    if Instant::now() + TOKEN_REFRESH_MARGIN < *expires_at {
                        return Ok(Some(token.clone()));
                    }
                }

                let base = if host.starts_with("http") {
                    host.clone()
                } else {
                    format!("http://{}", host)
                };
                let url = format!(
                    "{}/computeMetadata/v1/instance/service-accounts/default/token",
                    base.trim_end_matches('/')
                );
                let response = client
                    .get(&url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                let response = check_status(response, "Metadata server").await?;
                let token: MetadataToken = response.json().await.map_err(|e| {
                    Error::Config(format!("Unreadable metadata server token: {}", e))
                })?;

                debug!(
                    subsystem = "storage",
                    component = "gcs",
                    op = "token_refresh",
                    expires_in = token.expires_in,
                    "Fetched access token from metadata server"
                );
                let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
                *cached = Some((token.access_token.clone(), expires_at));
                Ok(Some(token.access_token))
            }
        }
    }
}

/// Configuration for [`GcsStorage`].
#[derive(Debug, Clone)]
pub struct GcsConfig {
    /// API endpoint; override for emulators and tests.
    pub base_url: String,
    pub token: GoogleTokenSource,
    /// Bucket the OCR handler stages files in and Vision writes to.
    pub bucket: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GCS_URL.to_string(),
            token: GoogleTokenSource::None,
            bucket: None,
            timeout_seconds: STORAGE_TIMEOUT_SECS,
        }
    }
}

impl GcsConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GCS_BASE_URL` | `https://storage.googleapis.com` | API endpoint |
    /// | `GOOGLE_CLOUD_VISION_BUCKET` | - | Staging/output bucket |
    /// | `GCS_TIMEOUT_SECS` | `120` | Request timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("GCS_BASE_URL").unwrap_or(defaults.base_url),
            token: GoogleTokenSource::from_env(),
            bucket: std::env::var("GOOGLE_CLOUD_VISION_BUCKET")
                .ok()
                .filter(|b| !b.trim().is_empty()),
            timeout_seconds: std::env::var("GCS_TIMEOUT_SECS")
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

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

/// Google Cloud Storage client.
#[derive(Clone)]
pub struct GcsStorage {
    client: Client,
    config: GcsConfig,
}

impl GcsStorage {
    pub fn new(config: GcsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GcsConfig::from_env())
    }

    pub fn config(&self) -> &GcsConfig {
        &self.config
    }

    /// Staging bucket, required by the OCR worker.
    pub fn bucket(&self) -> Result<&str> {
        self.config
            .bucket
            .as_deref()
            .ok_or_else(|| Error::Config("GOOGLE_CLOUD_VISION_BUCKET is not set".into()))
    }

    /// Shared token source, reused by the Vision client.
    pub fn token_source(&self) -> &GoogleTokenSource {
        &self.config.token
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| Error::Config(format!("Invalid GCS_BASE_URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("GCS_BASE_URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, path: &str) -> Result<Url> {
        // The object name is one segment, so '/' is percent-encoded.
        self.url(&["storage", "v1", "b", bucket, "o", path])
    }

    async fn authorize(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(match self.config.token.bearer(&self.client).await? {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }
}

#[async_trait]
impl ObjectStore for GcsStorage {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let mut url = self.object_url(bucket, path)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self.authorize(self.client.get(url)).await?.send().await?;
        let response = check_status(response, "GCS download").await?;
        let bytes = response.bytes().await?;

        debug!(
            subsystem = "storage",
            component = "gcs",
            op = "download",
            bucket,
            path,
            bytes = bytes.len(),
            "Downloaded object"
        );
        Ok(bytes.to_vec())
    }

    async fn upload(&self, bucket: &str, path: &str, data: &[u8], content_type: &str) -> Result<()> {
        validate_path(path)?;
        let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", path);

        let req = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .body(data.to_vec());
        let response = self.authorize(req).await?.send().await?;
        check_status(response, "GCS upload").await?;

        debug!(
            subsystem = "storage",
            component = "gcs",
            op = "upload",
            bucket,
            path,
            bytes = data.len(),
            "Uploaded object"
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(ref token) = page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self.authorize(self.client.get(url)).await?.send().await?;
            let response = check_status(response, "GCS list").await?;
            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("Unreadable GCS list response: {}", e)))?;

            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        validate_path(path)?;
        let url = self.object_url(bucket, path)?;
        let response = self.authorize(self.client.delete(url)).await?.send().await?;
        match check_status(response, "GCS delete").await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_encodes_slashes() {
        let store = GcsStorage::new(GcsConfig::default()).unwrap();
        let url = store.object_url("vision", "ocr-output/abc/output-1-to-2.json").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/vision/o/ocr-output%2Fabc%2Foutput-1-to-2.json"
        );
    }

    #[test]
    fn test_bucket_required() {
        let store = GcsStorage::new(GcsConfig::default()).unwrap();
        assert!(matches!(store.bucket(), Err(Error::Config(_))));

        let store = GcsStorage::new(GcsConfig::default().with_bucket("vision")).unwrap();
        assert_eq!(store.bucket().unwrap(), "vision");
    }

    #[test]
    fn test_token_source_debug_hides_secret() {
        let source = GoogleTokenSource::Static("ya29.secret".into());
        assert_eq!(format!("{:?}", source), "Static(***)");
    }

    #[tokio::test]
    async fn test_static_token_source() {
        let client = Client::new();
        let source = GoogleTokenSource::Static("abc".into());
        assert_eq!(source.bearer(&client).await.unwrap().as_deref(), Some("abc"));
        assert!(GoogleTokenSource::None.bearer(&client).await.unwrap().is_none());
    }
}
