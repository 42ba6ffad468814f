use super::{ CacheBackend, CacheEntry };
use crate::error::CacheError;
use async_trait::async_trait;
use redis::{ Client, AsyncCommands };
use redis::aio::MultiplexedConnection;
use std::time::Duration;

const KEY_PREFIX: &str = "cache:";

/// Records live under `cache:{key}`. Each one also carries a native Redis
/// expiry equal to the TTL so abandoned entries disappear without a sweep.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl RedisBackend {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, ttl_secs: ttl.as_secs() })
    }

    fn redis_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::redis_key(key)).await?;
        match raw {
            Some(raw) =>
                serde_json
                    ::from_str(&raw)
                    .map(Some)
                    .map_err(|e| CacheError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(entry)?;
        if self.ttl_secs > 0 {
            conn.set_ex::<_, _, ()>(Self::redis_key(key), value, self.ttl_secs).await?;
        } else {
            conn.set::<_, _, ()>(Self::redis_key(key), value).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::redis_key(key)).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(format!("{}*", KEY_PREFIX)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        Ok(
            keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
                .collect()
        )
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let keys = self.keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let full: Vec<String> = keys
            .iter()
            .map(|k| Self::redis_key(k))
            .collect();
        let removed: usize = conn.del(full).await?;
        Ok(removed)
    }
}
