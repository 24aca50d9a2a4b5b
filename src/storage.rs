//! Durable artifact storage
//!
//! The pipeline hands finished bytes to an [`ArtifactStore`] and attaches the
//! returned key plus a time-limited URL to the job result.

use crate::error::StorageError;
use crate::utils::extension_for;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub type Metadata = BTreeMap<String, String>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Prepare the backing store; called once before workers start.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Store `bytes` and return the key they can be fetched by.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String, StorageError>;

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

fn new_key(content_type: &str) -> String {
    format!(
        "{}/{}.{}",
        Utc::now().format("%Y/%m/%d"),
        Uuid::new_v4(),
        extension_for(content_type)
    )
}

fn expiring_url(base_url: &str, key: &str, ttl: Duration) -> String {
    let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
    format!("{}/{}?expires={}", base_url.trim_end_matches('/'), key, expires)
}

/// Filesystem store: artifacts under `root/<yyyy>/<mm>/<dd>/<uuid>.<ext>` with a
/// JSON metadata sidecar next to each.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    base_url: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its file, refusing keys that would escape the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::Configuration(format!("cannot create {}: {e}", self.root.display()))
        })?;
        Ok(())
    }

    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String, StorageError> {
        let key = new_key(content_type);
        let path = self.path_for(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut sidecar = metadata.clone();
        sidecar.insert("content_type".to_string(), content_type.to_string());
        sidecar.insert("size".to_string(), bytes.len().to_string());
        let sidecar = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        tokio::fs::write(&path, &bytes).await?;
        tokio::fs::write(Self::sidecar(&path), sidecar).await?;
        debug!(%key, size = bytes.len(), "Stored artifact");
        Ok(key)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(expiring_url(&self.base_url, key, ttl))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path).await?;
        let _ = tokio::fs::remove_file(Self::sidecar(&path)).await;
        debug!(%key, "Deleted artifact");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: Metadata,
}

/// Keeps artifacts in memory; used by one-shot renders and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredArtifact>,
}

impl MemoryStore {
    pub const BASE_URL: &'static str = "memory://artifacts";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredArtifact> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &Metadata,
    ) -> Result<String, StorageError> {
        let key = new_key(content_type);
        self.objects.insert(
            key.clone(),
            StoredArtifact {
                bytes,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(key)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.objects.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(expiring_url(Self::BASE_URL, key, ttl))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
