//! Local directory tree laid out as `{root}/{bucket}/{path}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use handbook_core::{Error, ObjectStore, Result};

use crate::validate_path;

/// Filesystem-backed [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        validate_path(bucket)?;
        validate_path(path)?;
        Ok(self.root.join(bucket).join(path))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(bucket, path)?;
        fs::read(&full_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{}/{}", bucket, path)),
            _ => Error::Io(e),
        })
    }

    async fn upload(&self, bucket: &str, path: &str, data: &[u8], _content_type: &str) -> Result<()> {
        let full_path = self.full_path(bucket, path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Atomic write: temp file + rename
        let mut temp_path = full_path.clone().into_os_string();
        temp_path.push(".part");
        let temp_path = PathBuf::from(temp_path);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(
                subsystem = "storage",
                component = "filesystem",
                from = %temp_path.display(),
                to = %full_path.display(),
                error = %e,
                "Rename failed"
            );
            e
        })?;

        debug!(
            subsystem = "storage",
            component = "filesystem",
            op = "upload",
            bucket,
            path,
            bytes = data.len(),
            "Stored object"
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        validate_path(bucket)?;
        let bucket_root = self.root.join(bucket);
        let mut names = Vec::new();
        let mut pending = vec![bucket_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(prefix) && !name.ends_with(".part") {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let full_path = self.full_path(bucket, path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());

        store
            .upload("vision", "ocr-output/j1/output-1-to-2.json", b"{}", "application/json")
            .await
            .unwrap();
        store
            .upload("vision", "ocr-output/j1/output-3-to-3.json", b"{}", "application/json")
            .await
            .unwrap();
        store
            .upload("vision", "ocr-input/j1.pdf", b"%PDF-1.4", "application/pdf")
            .await
            .unwrap();

        assert_eq!(
            store.download("vision", "ocr-input/j1.pdf").await.unwrap(),
            b"%PDF-1.4"
        );
        assert_eq!(
            store.list("vision", "ocr-output/j1/").await.unwrap(),
            vec![
                "ocr-output/j1/output-1-to-2.json".to_string(),
                "ocr-output/j1/output-3-to-3.json".to_string(),
            ]
        );

        store.delete("vision", "ocr-input/j1.pdf").await.unwrap();
        store.delete("vision", "ocr-input/j1.pdf").await.unwrap();
        assert!(matches!(
            store.download("vision", "ocr-input/j1.pdf").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_missing_bucket_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        assert!(store.list("nothing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        assert!(matches!(
            store.download("documents", "../secret").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
