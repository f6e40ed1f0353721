use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CacheKey, CacheStore, Entry, StoreError};

/// In-process store behind the same contract as [`super::DiskStore`]; contents do not survive
/// a restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &CacheKey, entry: &Entry) -> Result<(), StoreError> {
        self.entries.write().insert(key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};

    use crate::proxy::origin::Origin;

    #[tokio::test]
    async fn behaves_like_a_store() -> anyhow::Result<()> {
        let origin = Origin::parse("http://origin.test")?;
        let store = MemoryStore::new();
        let key = CacheKey::derive(&origin, &Method::GET, "/items", None, None);
        let entry = Entry::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"hi"));

        assert!(store.get(&key).await?.is_none());
        store.set(&key, &entry).await?;
        assert_eq!(store.get(&key).await?, Some(entry));
        assert_eq!(store.len(), 1);

        store.delete(&key).await?;
        store.delete(&key).await?;
        assert!(store.is_empty());

        for path in ["/a", "/b", "/c"] {
            let key = CacheKey::derive(&origin, &Method::GET, path, None, None);
            store
                .set(
                    &key,
                    &Entry::new(StatusCode::OK, HeaderMap::new(), Bytes::new()),
                )
                .await?;
        }
        assert_eq!(store.clear().await?, 3);
        assert!(store.is_empty());
        Ok(())
    }
}
