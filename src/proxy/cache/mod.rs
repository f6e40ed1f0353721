mod disk;
mod entry;
mod key;
mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::settings::{CacheMode, Settings};

pub use disk::DiskStore;
pub use entry::{Entry, EntryDecodeError};
pub use key::CacheKey;
pub use memory::MemoryStore;

/// Durable mapping from cache key to response entry.
///
/// Implementations must publish writes atomically: a `get` racing a `set` for the same key
/// observes either the previous entry or the new one in full.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns `Ok(None)` when no entry exists. Unreadable or undecodable entries are errors.
    async fn get(&self, key: &CacheKey) -> Result<Option<Entry>, StoreError>;

    async fn set(&self, key: &CacheKey, entry: &Entry) -> Result<(), StoreError>;

    /// Removing an absent key succeeds.
    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Removes every stored entry and returns how many were removed.
    async fn clear(&self) -> Result<usize, StoreError>;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt cache entry at {}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: CorruptEntry,
    },
    #[error("failed to encode cache entry")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CorruptEntry {
    #[error("malformed entry document")]
    Json(#[from] serde_json::Error),
    #[error("ill-formed entry")]
    Entry(#[from] EntryDecodeError),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Opens the store selected by `settings.cache`, or `None` when caching is off.
pub async fn open_store(settings: &Settings) -> Result<Option<Arc<dyn CacheStore>>> {
    let store: Arc<dyn CacheStore> = match settings.cache {
        CacheMode::Off => {
            info!("response cache disabled");
            return Ok(None);
        }
        CacheMode::Memory => Arc::new(MemoryStore::new()),
        CacheMode::Disk => {
            let root = settings.cache_dir()?;
            let store = DiskStore::open(&root)
                .await
                .with_context(|| format!("failed to open cache directory {}", root.display()))?;
            Arc::new(store)
        }
    };
    info!(backend = store.backend(), "response cache enabled");
    Ok(Some(store))
}
