pub mod redis;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::info;
use std::error::Error;
use crate::cli::Args;
use crate::error::PersistenceError;
use crate::models::chat::{ ConversationSummary, ConversationTurn, Role };
use crate::text::truncate_with_marker;
use std::sync::Arc;

pub const TITLE_MAX_CHARS: usize = 30;
pub const UNTITLED_CONVERSATION: &str = "New conversation";

/// Append-only log of conversation turns.
///
/// Implementations must make `append` a single atomic write so concurrent
/// writers on the same conversation never interleave partial records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), PersistenceError>;

    /// Turns of one conversation in append order.
    async fn list(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, PersistenceError>;

    /// Every conversation, most recently active first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError>;

    /// Returns the number of turns removed; unknown ids remove nothing.
    async fn delete(&self, conversation_id: &str) -> Result<usize, PersistenceError>;
}

/// Display title from the conversation's first user message.
pub fn derive_title(first_user_content: Option<&str>) -> String {
    match first_user_content {
        Some(content) => truncate_with_marker(content, TITLE_MAX_CHARS, "..."),
        None => UNTITLED_CONVERSATION.to_string(),
    }
}

pub(crate) fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::<Utc>
        ::from_timestamp_millis(millis)
        .ok_or_else(|| PersistenceError::Corrupt(format!("timestamp out of range: {}", millis)))
}

pub async fn create_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    match args.history_type.to_lowercase().as_str() {
        "sqlite" => {
            let store = sqlite::SqliteHistoryStore::open(&args.history_host)?;
            Ok(Arc::new(store))
        }
        "redis" => {
            let store = redis::RedisHistoryStore::new(
                &args.history_host,
                &args.history_redis_prefix
            )?;
            Ok(Arc::new(store))
        }
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported history store type: {}", args.history_type)
                    )
                )
            ),
    }
}

pub async fn initialize_history_store(
    args: &Args
) -> Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_host);
    create_history_store(args).await
}
