//! One JSON file per cache record.

use super::{ CacheBackend, CacheEntry };
use crate::error::CacheError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };
use tokio::fs;
use uuid::Uuid;

const EXTENSION: &str = "json";

pub struct DiskBackend {
    dir: PathBuf,
}

impl DiskBackend {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, EXTENSION))
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let bytes = match fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => {
                return Err(e.into());
            }
        };
        serde_json
            ::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupt { key: key.to_string(), reason: e.to_string() })
    }

    async fn write(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry)?;
        // Write-then-rename so concurrent readers see the old or the new record, never half of one.
        let tmp = self.dir.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, self.path_for(key)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in self.keys().await? {
            self.remove(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
