use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Local-disk blob store for processed results.
pub struct ResultStorage {
    root: PathBuf,
}

impl ResultStorage {
    /// Create the store, making sure `root` exists.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    /// Path a key maps to. Keys are flat file names.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Write bytes under `key`, replacing any previous blob.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Remove blobs last modified more than `max_age` ago. Returns how many
    /// files were deleted; individual failures are logged and skipped.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Cleaned up old file");
                    removed += 1;
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to clean up file"),
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Stored object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
