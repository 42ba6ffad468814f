use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use log::error;
use redis::{ AsyncCommands, Client, Script };
use serde::Deserialize;

use crate::error::PersistenceError;
use crate::history::{ derive_title, timestamp_from_millis, HistoryStore };
use crate::models::chat::{ ConversationSummary, ConversationTurn, Role };

lazy_static! {
    // Clamps the timestamp to the conversation's latest, then pushes the turn
    // and bumps the index, all inside one server-side call.
    static ref APPEND_TURN: Script = Script::new(
        r#"
local latest = tonumber(redis.call('ZSCORE', KEYS[2], ARGV[1])) or 0
local timestamp = math.max(tonumber(ARGV[2]), latest)
local turn = cjson.encode({ role = ARGV[3], content = ARGV[4], timestamp = timestamp })
redis.call('RPUSH', KEYS[1], turn)
redis.call('ZADD', KEYS[2], timestamp, ARGV[1])
return timestamp
"#
    );
}

#[derive(Deserialize)]
struct StoredTurn {
    role: Role,
    content: String,
    timestamp: i64,
}

/// Turns are kept as JSON in a list per conversation (`{prefix}turns:{id}`).
/// A sorted set at `{prefix}index` scores each conversation by the
/// millisecond timestamp of its latest turn.
pub struct RedisHistoryStore {
    client: Client,
    key_prefix: String,
}

impl RedisHistoryStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, PersistenceError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn turns_key(&self, conversation_id: &str) -> String {
        format!("{}turns:{}", self.key_prefix, conversation_id)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.key_prefix)
    }

    fn decode(conversation_id: &str, raw: &str) -> Option<ConversationTurn> {
        let stored = match serde_json::from_str::<StoredTurn>(raw) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Error parsing history entry for {}: {}", conversation_id, e);
                return None;
            }
        };
        match timestamp_from_millis(stored.timestamp) {
            Ok(timestamp) =>
                Some(ConversationTurn {
                    conversation_id: conversation_id.to_string(),
                    role: stored.role,
                    content: stored.content,
                    timestamp,
                }),
            Err(e) => {
                error!("Error parsing history entry for {}: {}", conversation_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), PersistenceError> {
        let mut conn = self.get_connection().await?;
        APPEND_TURN
            .key(self.turns_key(conversation_id))
            .key(self.index_key())
            .arg(conversation_id)
            .arg(Utc::now().timestamp_millis())
            .arg(role.as_str())
            .arg(content)
            .invoke_async::<_, i64>(&mut conn).await?;
        Ok(())
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, PersistenceError> {
        let mut conn = self.get_connection().await?;
        let entries: Vec<String> = conn.lrange(self.turns_key(conversation_id), 0, -1).await?;
        Ok(
            entries
                .iter()
                .filter_map(|raw| Self::decode(conversation_id, raw))
                .collect()
        )
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        let mut conn = self.get_connection().await?;
        let ranked: Vec<(String, f64)> = conn.zrevrange_withscores(self.index_key(), 0, -1).await?;

        let mut summaries = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            let entries: Vec<String> = conn.lrange(self.turns_key(&id), 0, -1).await?;
            let first_user = entries
                .iter()
                .filter_map(|raw| Self::decode(&id, raw))
                .find(|turn| turn.role == Role::User)
                .map(|turn| turn.content);
            summaries.push(ConversationSummary {
                title: derive_title(first_user.as_deref()),
                timestamp: timestamp_from_millis(score as i64)?,
                id,
            });
        }
        Ok(summaries)
    }

    async fn delete(&self, conversation_id: &str) -> Result<usize, PersistenceError> {
        let mut conn = self.get_connection().await?;
        let key = self.turns_key(conversation_id);
        let (removed, _, _): (usize, i64, i64) = redis
            ::pipe()
            .atomic()
            .llen(&key)
            .del(&key)
            .zrem(self.index_key(), conversation_id)
            .query_async(&mut conn).await?;
        Ok(removed)
    }
}
