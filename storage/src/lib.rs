//! Umbra Storage Layer
//!
//! Provides persistent storage for the public decryption request lifecycle.
//!
//! # Architecture
//!
//! The storage layer uses redb (an embedded database) for:
//! - Decryption requests keyed by id, with an explicit status enum
//! - A monotonic id counter that survives restarts
//!
//! Ciphertexts and ACLs are held in memory by the engine; only the request
//! lifecycle needs to outlive the process so an answer arriving after a restart
//! is still matched exactly once.

pub mod requests;
mod error;

pub use error::{StorageError, StorageResult};
pub use requests::{DecryptionRecord, RequestStatus, RequestStore};

use std::path::Path;
use std::sync::Arc;
use redb::backends::InMemoryBackend;
use redb::Database;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database path; `None` keeps everything in memory
    pub path: Option<std::path::PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Some(std::path::PathBuf::from("./umbra_data/requests.redb")),
        }
    }
}

/// Main storage interface
pub struct Storage {
    config: StorageConfig,
    pub requests: Arc<RequestStore>,
}

impl Storage {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let config = StorageConfig {
            path: Some(path.as_ref().to_path_buf()),
        };
        Self::with_config(config)
    }

    /// Volatile storage for tests and ephemeral engines
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(StorageConfig { path: None })
    }

    /// Open storage with custom configuration
    pub fn with_config(config: StorageConfig) -> StorageResult<Self> {
        let db = match &config.path {
            Some(path) => {
                // Ensure directory exists
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Database::create(path)?
            }
            None => Database::builder().create_with_backend(InMemoryBackend::new())?,
        };
        let db = Arc::new(db);

        let requests = Arc::new(RequestStore::new(db)?);

        tracing::info!(path = ?config.path, "opened request storage");

        Ok(Self { config, requests })
    }

    /// Get storage configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Get database statistics
    pub fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            path: self.config.path.clone(),
            request_count: self.requests.count()?,
            pending_count: self.requests.pending()?.len() as u64,
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub path: Option<std::path::PathBuf>,
    pub request_count: u64,
    pub pending_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_storage_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let storage = Storage::open(&path).unwrap();
        let stats = storage.stats().unwrap();

        assert_eq!(stats.request_count, 0);
        assert_eq!(stats.pending_count, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = Storage::in_memory().unwrap();
        let record = storage.requests.create([1u8; 32], [2u8; 32], 5).unwrap();
        storage.requests.mark_pending(record.id).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert!(stats.path.is_none());
    }
}
