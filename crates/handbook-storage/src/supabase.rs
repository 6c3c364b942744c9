//! Supabase Storage over its REST API.
//!
//! The product keeps uploaded PDFs in the `documents` bucket; the OCR worker
//! reads them with the service-role key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use handbook_core::defaults::{SOURCE_BUCKET, STORAGE_TIMEOUT_SECS};
use handbook_core::{Error, ObjectStore, Result};

use crate::{check_status, truncate, validate_path};

/// Page size for list requests.
const LIST_PAGE_SIZE: usize = 1000;

/// Configuration for [`SupabaseStorage`].
#[derive(Clone)]
pub struct SupabaseStorageConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub service_role_key: String,
    /// Bucket holding uploaded source documents.
    pub bucket: String,
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for SupabaseStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseStorageConfig")
            .field("url", &self.url)
            .field("service_role_key", &"***")
            .field("bucket", &self.bucket)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl SupabaseStorageConfig {
    pub fn new(url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_role_key: service_role_key.into(),
            bucket: SOURCE_BUCKET.to_string(),
            timeout_seconds: STORAGE_TIMEOUT_SECS,
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SUPABASE_URL` / `NEXT_PUBLIC_SUPABASE_URL` | required | Project URL |
    /// | `SUPABASE_SERVICE_ROLE_KEY` | required | Service-role key |
    /// | `SUPABASE_STORAGE_BUCKET` | `documents` | Source bucket |
    /// | `SUPABASE_STORAGE_TIMEOUT_SECS` | `120` | Request timeout |
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL")
            .or_else(|_| std::env::var("NEXT_PUBLIC_SUPABASE_URL"))
            .map_err(|_| Error::Config("SUPABASE_URL is not set".into()))?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| Error::Config("SUPABASE_SERVICE_ROLE_KEY is not set".into()))?;

        let mut config = Self::new(url, key);
        if let Ok(bucket) = std::env::var("SUPABASE_STORAGE_BUCKET") {
            if !bucket.trim().is_empty() {
                config.bucket = bucket;
            }
        }
        if let Some(timeout) = std::env::var("SUPABASE_STORAGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout_seconds = timeout;
        }
        Ok(config)
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
    #[serde(rename = "sortBy")]
    sort_by: SortBy,
}

#[derive(Serialize)]
struct SortBy {
    column: &'static str,
    order: &'static str,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    /// Null for folder placeholders.
    id: Option<String>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    prefixes: [&'a str; 1],
}

/// Supabase Storage client.
#[derive(Clone)]
pub struct SupabaseStorage {
    client: Client,
    config: SupabaseStorageConfig,
}

impl SupabaseStorage {
    pub fn new(config: SupabaseStorageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SupabaseStorageConfig::from_env()?)
    }

    /// Source bucket documents are read from.
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn url(&self, segments: &[&str], path: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| Error::Config(format!("Invalid SUPABASE_URL: {}", e)))?;
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| Error::Config("SUPABASE_URL cannot be a base".into()))?;
            parts.pop_if_empty().extend(["storage", "v1", "object"]).extend(segments);
            if let Some(path) = path {
                parts.extend(path.split('/'));
            }
        }
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.config.service_role_key)
            .header("apikey", &self.config.service_role_key)
    }

    /// Supabase reports some missing objects as 400 with a `not_found` body.
    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status() != reqwest::StatusCode::BAD_REQUEST {
            return check_status(response, what).await;
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned 400: {}", what, truncate(&body));
        if body.contains("not_found") || body.contains("Object not found") {
            Err(Error::NotFound(message))
        } else {
            Err(Error::Storage(message))
        }
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let url = self.url(&[bucket], Some(path))?;
        let response = self.authorize(self.client.get(url)).send().await?;
        let response = Self::check(response, "Supabase download").await?;
        let bytes = response.bytes().await?;

        debug!(
            subsystem = "storage",
            component = "supabase",
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
        let url = self.url(&[bucket], Some(path))?;
        let req = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(data.to_vec());
        let response = self.authorize(req).send().await?;
        Self::check(response, "Supabase upload").await?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        // The API lists one folder; the remainder filters names within it.
        let (folder, partial) = match prefix.rfind('/') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => ("", prefix),
        };

        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let url = self.url(&["list", bucket], None)?;
            let body = ListRequest {
                prefix: folder,
                limit: LIST_PAGE_SIZE,
                offset,
                sort_by: SortBy {
                    column: "name",
                    order: "asc",
                },
            };
            let response = self.authorize(self.client.post(url).json(&body)).send().await?;
            let response = Self::check(response, "Supabase list").await?;
            let page: Vec<ListEntry> = response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("Unreadable Supabase list response: {}", e)))?;

            let count = page.len();
            names.extend(
                page.into_iter()
                    .filter(|e| e.id.is_some() && e.name.starts_with(partial))
                    .map(|e| {
                        if folder.is_empty() {
                            e.name
                        } else {
                            format!("{}/{}", folder, e.name)
                        }
                    }),
            );
            if count < LIST_PAGE_SIZE {
                break;
            }
            offset += count;
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        validate_path(path)?;
        let url = self.url(&[bucket], None)?;
        let body = DeleteRequest { prefixes: [path] };
        let response = self
            .authorize(self.client.delete(url).json(&body))
            .send()
            .await?;
        match Self::check(response, "Supabase delete").await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn backend_name(&self) -> &'static str {
        "supabase"
    }
}
