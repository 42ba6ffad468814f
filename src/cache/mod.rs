pub mod disk;
pub mod memory;
pub mod redis;

use crate::cli::Args;
use crate::error::CacheError;
use crate::models::chat::Message;
use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ debug, info, warn };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use sha2::{ Digest, Sha256 };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub response: Value,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(response: Value) -> Self {
        Self { response, created_at: Utc::now() }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        // Entries stamped in the future (clock skew) count as fresh.
        match age.to_std() {
            Ok(age) => age >= ttl,
            Err(_) => false,
        }
    }
}

/// Point-lookup storage behind [`ResponseCache`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn write(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
    async fn clear(&self) -> Result<usize, CacheError>;
}

/// Cache key for a request: hex SHA-256 over the model name and the
/// canonical JSON of the message sequence.
pub fn cache_key(model: &str, messages: &[Message]) -> Result<String, CacheError> {
    let serialized = serde_json::to_string(messages)?;
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b":");
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// TTL-bounded response cache. Never fails: every backend error turns into
/// a miss or a skipped write.
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(memory::MemoryBackend::default()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, model: &str, messages: &[Message]) -> Option<Value> {
        let key = match cache_key(model, messages) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cache key derivation failed: {}", e);
                return None;
            }
        };

        let entry = match self.backend.read(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return None;
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                return None;
            }
        };

        if entry.is_expired(self.ttl, Utc::now()) {
            debug!("Cache entry {} expired, removing", key);
            if let Err(e) = self.backend.remove(&key).await {
                warn!("Failed to remove expired cache entry {}: {}", key, e);
            }
            return None;
        }

        Some(entry.response)
    }

    pub async fn put(&self, model: &str, messages: &[Message], response: &Value) {
        let key = match cache_key(model, messages) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cache key derivation failed: {}", e);
                return;
            }
        };
        let entry = CacheEntry::new(response.clone());
        match self.backend.write(&key, &entry).await {
            Ok(()) => debug!("Cached response under {}", key),
            Err(e) => warn!("Cache write failed for {}: {}", key, e),
        }
    }

    pub async fn clear(&self) -> usize {
        match self.backend.clear().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cache clear failed: {}", e);
                0
            }
        }
    }

    /// Removes expired entries and entries that can no longer be read.
    pub async fn clear_expired(&self) -> usize {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache sweep could not list entries: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut removed = 0;
        for key in keys {
            let stale = match self.backend.read(&key).await {
                Ok(Some(entry)) => entry.is_expired(self.ttl, now),
                Ok(None) => false,
                Err(e) => {
                    debug!("Dropping unreadable cache entry {}: {}", key, e);
                    true
                }
            };
            if stale {
                match self.backend.remove(&key).await {
                    Ok(()) => {
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove cache entry {}: {}", key, e),
                }
            }
        }
        removed
    }

    /// Periodic [`clear_expired`](Self::clear_expired) owned by the host.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.clear_expired().await;
                if removed > 0 {
                    info!("Cache sweep removed {} entries", removed);
                }
            }
        })
    }
}

pub async fn init(args: &Args) -> Result<Option<Arc<ResponseCache>>, Box<dyn Error + Send + Sync>> {
    if !args.enable_cache {
        info!("Cache disabled.");
        return Ok(None);
    }

    let ttl = Duration::from_secs(args.cache_ttl);
    let backend: Arc<dyn CacheBackend> = match args.cache_type.to_lowercase().as_str() {
        "disk" => Arc::new(disk::DiskBackend::open(&args.cache_dir).await?),
        "redis" => Arc::new(redis::RedisBackend::connect(&args.cache_redis_url, ttl).await?),
        "memory" => Arc::new(memory::MemoryBackend::default()),
        other => {
            return Err(format!("Unsupported cache type: {}", other).into());
        }
    };
    info!("Response cache: {} backend, TTL {}s", args.cache_type, args.cache_ttl);
    Ok(Some(Arc::new(ResponseCache::new(backend, ttl))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ ContentPart, MessageContent, Role };
    use serde_json::json;

    fn conversation() -> Vec<Message> {
        vec![Message::system("be brief"), Message::user("hi")]
    }

    #[test]
    fn key_is_deterministic() {
        let a = cache_key("llama2", &conversation()).unwrap();
        let b = cache_key("llama2", &conversation()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_changes_with_any_field() {
        let base = cache_key("llama2", &conversation()).unwrap();

        assert_ne!(base, cache_key("mistral", &conversation()).unwrap());

        let mut role_changed = conversation();
        role_changed[1].role = Role::Assistant;
        assert_ne!(base, cache_key("llama2", &role_changed).unwrap());

        let mut content_changed = conversation();
        content_changed[1] = Message::user("hi!");
        assert_ne!(base, cache_key("llama2", &content_changed).unwrap());

        let reordered = vec![Message::user("hi"), Message::system("be brief")];
        assert_ne!(base, cache_key("llama2", &reordered).unwrap());

        let mut parts = conversation();
        parts[1].content = MessageContent::Parts(
            vec![ContentPart::Text { text: "hi".into() }]
        );
        assert_ne!(base, cache_key("llama2", &parts).unwrap());
    }

    #[test]
    fn model_and_message_boundary_is_unambiguous() {
        let a = cache_key("a", &[Message::user("b")]).unwrap();
        let b = cache_key("a:", &[Message::user("b")]).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn get_after_put_returns_stored_response() {
        let cache = ResponseCache::in_memory(DEFAULT_TTL);
        let body = json!({"message": {"role": "assistant", "content": "hello"}, "done": true});

        assert!(cache.get("llama2", &conversation()).await.is_none());
        cache.put("llama2", &conversation(), &body).await;
        assert_eq!(cache.get("llama2", &conversation()).await, Some(body));
        assert!(cache.get("mistral", &conversation()).await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_removed() {
        let backend = Arc::new(memory::MemoryBackend::default());
        let cache = ResponseCache::new(backend.clone(), Duration::from_secs(60));
        let key = cache_key("llama2", &conversation()).unwrap();
        let stale = CacheEntry {
            response: json!({"message": {"content": "old"}}),
            created_at: Utc::now() - chrono::Duration::seconds(61),
        };
        backend.write(&key, &stale).await.unwrap();

        assert!(cache.get("llama2", &conversation()).await.is_none());
        assert!(backend.read(&key).await.unwrap().is_none());
        assert_eq!(cache.clear_expired().await, 0);
    }

    #[tokio::test]
    async fn clear_expired_keeps_fresh_entries() {
        let backend = Arc::new(memory::MemoryBackend::default());
        let cache = ResponseCache::new(backend.clone(), Duration::from_secs(60));
        cache.put("llama2", &conversation(), &json!({"fresh": true})).await;
        let stale = CacheEntry {
            response: json!({"fresh": false}),
            created_at: Utc::now() - chrono::Duration::hours(2),
        };
        backend.write("stale-key", &stale).await.unwrap();

        assert_eq!(cache.clear_expired().await, 1);
        assert_eq!(backend.keys().await.unwrap().len(), 1);
        assert!(cache.get("llama2", &conversation()).await.is_some());
    }

    #[tokio::test]
    async fn zero_ttl_never_hits() {
        let cache = ResponseCache::in_memory(Duration::ZERO);
        cache.put("llama2", &conversation(), &json!({})).await;
        assert!(cache.get("llama2", &conversation()).await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = ResponseCache::in_memory(DEFAULT_TTL);
        cache.put("llama2", &conversation(), &json!(1)).await;
        cache.put("mistral", &conversation(), &json!(2)).await;
        assert_eq!(cache.clear().await, 2);
        assert!(cache.get("llama2", &conversation()).await.is_none());
    }

    #[test]
    fn future_entries_are_fresh() {
        let entry = CacheEntry {
            response: json!(null),
            created_at: Utc::now() + chrono::Duration::seconds(30),
        };
        assert!(!entry.is_expired(Duration::from_secs(1), Utc::now()));
    }
}
