//! In-process object store for tests and local runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use handbook_core::{Error, ObjectStore, Result};

type Objects = BTreeMap<(String, String), (Vec<u8>, String)>;

/// [`ObjectStore`] keeping objects in a shared map.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Objects>> {
        self.objects
            .lock()
            .map_err(|_| Error::Internal("Memory object store lock poisoned".into()))
    }

    /// Seed an object.
    pub fn insert(&self, bucket: &str, path: &str, data: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.lock() {
            objects.insert(
                (bucket.to_string(), path.to_string()),
                (data.into(), "application/octet-stream".to_string()),
            );
        }
    }

    pub fn contains(&self, bucket: &str, path: &str) -> bool {
        self.lock()
            .map(|o| o.contains_key(&(bucket.to_string(), path.to_string())))
            .unwrap_or(false)
    }

    /// Content type recorded at upload.
    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.lock()
            .ok()?
            .get(&(bucket.to_string(), path.to_string()))
            .map(|(_, ct)| ct.clone())
    }

    /// Number of objects across all buckets.
    pub fn len(&self) -> usize {
        self.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(&(bucket.to_string(), path.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, path)))
    }

    async fn upload(&self, bucket: &str, path: &str, data: &[u8], content_type: &str) -> Result<()> {
        self.lock()?.insert(
            (bucket.to_string(), path.to_string()),
            (data.to_vec(), content_type.to_string()),
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(b, p)| b == bucket && p.starts_with(prefix))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        self.lock()?.remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
