//! Secret store backends.
//!
//! A secret store is an opaque key-value blob store addressed by
//! slash-separated relative paths (`cert/acme/example.com.key.pem`). The
//! backend is chosen once from configuration and injected wherever blob
//! storage is needed.
//!
//! # Directory Structure (local backend)
//!
//! ```text
//! secrets/
//! ├── cert/
//! │   └── acme/
//! │       ├── example.com.key.pem
//! │       └── example.com.cert.pem
//! └── certificates/
//!     └── <id>/
//!         ├── cert.pem
//!         ├── key.pem
//!         └── meta.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, trace};

use sitekeeper_config::SecretBackend;

use super::error::SecretError;

/// Keyed blob storage
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a blob; `Ok(None)` when nothing is stored at `path`
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SecretError>;

    /// Write a blob, replacing any previous value
    async fn put(&self, path: &str, value: &[u8]) -> Result<(), SecretError>;

    /// Remove a blob; missing paths are not an error
    async fn delete(&self, path: &str) -> Result<(), SecretError>;

    /// All stored paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SecretError>;
}

/// Build the backend selected by configuration
pub fn from_backend(backend: &SecretBackend) -> Result<Arc<dyn SecretStore>, SecretError> {
    match backend {
        SecretBackend::Local { path } => Ok(Arc::new(FsSecretStore::new(path)?)),
        SecretBackend::Memory => Ok(Arc::new(MemorySecretStore::new())),
    }
}

/// Reject paths that are empty, absolute, or climb out of the store root
fn validate_path(path: &str) -> Result<(), SecretError> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");

    if valid {
        Ok(())
    } else {
        Err(SecretError::InvalidPath(path.to_string()))
    }
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Secret store backed by files under a base directory
///
/// Directories are created 0700 and files 0600 on Unix.
#[derive(Debug)]
pub struct FsSecretStore {
    base_path: PathBuf,
}

impl FsSecretStore {
    /// Create the store, creating the base directory if it doesn't exist
    pub fn new(base_path: &Path) -> Result<Self, SecretError> {
        std::fs::create_dir_all(base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(base_path, std::fs::Permissions::from_mode(0o700))?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized local secret storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SecretError> {
        validate_path(path)?;
        Ok(self.base_path.join(path))
    }
}

#[async_trait]
impl SecretStore for FsSecretStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SecretError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => {
                trace!(path = %path, bytes = data.len(), "Read secret");
                Ok(Some(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<(), SecretError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename so readers never see a partial blob
        let mut tmp = full.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &full).await?;
        debug!(path = %path, bytes = value.len(), "Stored secret");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SecretError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                debug!(path = %path, "Deleted secret");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SecretError> {
        let mut found = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(".tmp") {
                    found.push(key);
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Secret store held in process memory
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, SecretError> {
        validate_path(path)?;
        Ok(self.entries.get(path).map(|v| v.value().clone()))
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<(), SecretError> {
        validate_path(path)?;
        self.entries.insert(path.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), SecretError> {
        validate_path(path)?;
        self.entries.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SecretError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
