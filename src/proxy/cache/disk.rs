use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::entry::PersistedEntry;
use super::key::ENTRY_EXTENSION;
use super::{CacheKey, CacheStore, CorruptEntry, Entry, StoreError};

const TEMP_EXTENSION: &str = "tmp";

/// File-per-entry store rooted at a directory, sharded two levels deep by key prefix.
pub struct DiskStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DiskStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        async_fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::io(&root, source))?;
        debug!(root = %root.display(), "opened disk cache store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        key.shard_path(&self.root)
    }

    // Locks are created on first use and never removed.
    fn lock_for(&self, key: &CacheKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(key.as_str().to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Entry>, StoreError> {
        let path = self.entry_path(key);
        let bytes = match async_fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let persisted: PersistedEntry =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source: CorruptEntry::from(source),
            })?;
        let entry = Entry::from_persisted(persisted).map_err(|source| StoreError::Corrupt {
            path,
            source: CorruptEntry::from(source),
        })?;
        Ok(Some(entry))
    }

    async fn set(&self, key: &CacheKey, entry: &Entry) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&entry.to_persisted()).map_err(StoreError::Encode)?;
        let path = self.entry_path(key);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        async_fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::io(&dir, source))?;
        let temp_path = dir.join(format!(
            "{key}.{}.{TEMP_EXTENSION}",
            Uuid::new_v4().simple()
        ));
        if let Err(source) = write_temp_file(&temp_path, &payload).await {
            discard_temp_file(&temp_path).await;
            return Err(StoreError::io(&temp_path, source));
        }
        if let Err(source) = async_fs::rename(&temp_path, &path).await {
            discard_temp_file(&temp_path).await;
            return Err(StoreError::Io { path, source });
        }
        trace!(key = %key, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || remove_entry_files(&root))
            .await
            .map_err(|err| StoreError::io(&self.root, std::io::Error::other(err)))?
    }

    fn backend(&self) -> &'static str {
        "disk"
    }
}

async fn write_temp_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut options = async_fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn discard_temp_file(path: &Path) {
    if let Err(err) = async_fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %err, "failed to remove temporary cache file");
    }
}

/// Walks `root` without following symlinks and removes every `*.json` file.
fn remove_entry_files(root: &Path) -> Result<usize, StoreError> {
    let mut removed = 0usize;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(source) => return Err(StoreError::io(&dir, source)),
        };
        for item in read_dir {
            let item = item.map_err(|source| StoreError::io(&dir, source))?;
            let path = item.path();
            let file_type = item
                .file_type()
                .map_err(|source| StoreError::io(&path, source))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION)
            {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::io(&path, source)),
            }
        }
    }
    Ok(removed)
}
