use super::{ CacheBackend, CacheEntry };
use crate::error::CacheError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut guard = self.entries.write().await;
        let removed = guard.len();
        guard.clear();
        Ok(removed)
    }
}
