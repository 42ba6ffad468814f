//! SQLite-backed history.
//!
//! The connection sits behind a mutex and every call runs inside
//! `spawn_blocking`, holding the lock only for its own statement(s).

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use rusqlite::{ params, Connection };
use std::path::Path;
use std::sync::{ Arc, Mutex };

use crate::error::PersistenceError;
use crate::history::{ derive_title, timestamp_from_millis, HistoryStore };
use crate::models::chat::{ ConversationSummary, ConversationTurn, Role };

const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS chat_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chat_history_conversation
        ON chat_history (conversation_id, id);";

// The timestamp is clamped to the conversation's latest one so it never goes
// backwards, even if the wall clock does.
const INSERT_TURN: &str =
    "INSERT INTO chat_history (conversation_id, role, content, timestamp)
     VALUES (?1, ?2, ?3, MAX(?4, COALESCE(
        (SELECT MAX(timestamp) FROM chat_history WHERE conversation_id = ?1), 0)))";

const SELECT_TURNS: &str =
    "SELECT conversation_id, role, content, timestamp
     FROM chat_history WHERE conversation_id = ?1 ORDER BY id ASC";

const SELECT_CONVERSATIONS: &str =
    "SELECT h.conversation_id, h.timestamp,
        (SELECT f.content FROM chat_history f
         WHERE f.conversation_id = h.conversation_id AND f.role = 'user'
         ORDER BY f.id ASC LIMIT 1)
     FROM chat_history h
     WHERE h.id IN (SELECT MAX(id) FROM chat_history GROUP BY conversation_id)
     ORDER BY h.timestamp DESC, h.id DESC";

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::init(Connection::open(path)?)?;
        info!("History database opened at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch("PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, PersistenceError>
        where
            F: FnOnce(&mut Connection) -> Result<T, PersistenceError> + Send + 'static,
            T: Send + 'static
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| PersistenceError::Poisoned)?;
            f(&mut guard)
        }).await?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str
    ) -> Result<(), PersistenceError> {
        let conversation_id = conversation_id.to_string();
        let content = content.to_string();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(INSERT_TURN, params![conversation_id, role.as_str(), content, now])?;
            Ok(())
        }).await
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, PersistenceError> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(SELECT_TURNS)?;
            let rows = stmt
                .query_map(params![conversation_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(conversation_id, role, content, timestamp)| {
                    Ok(ConversationTurn {
                        conversation_id,
                        role: role
                            .parse()
                            .map_err(|e: crate::models::chat::ParseRoleError| {
                                PersistenceError::Corrupt(e.to_string())
                            })?,
                        content,
                        timestamp: timestamp_from_millis(timestamp)?,
                    })
                })
                .collect()
        }).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(SELECT_CONVERSATIONS)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, timestamp, first_user)| {
                    Ok(ConversationSummary {
                        id,
                        title: derive_title(first_user.as_deref()),
                        timestamp: timestamp_from_millis(timestamp)?,
                    })
                })
                .collect()
        }).await
    }

    async fn delete(&self, conversation_id: &str) -> Result<usize, PersistenceError> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM chat_history WHERE conversation_id = ?1",
                params![conversation_id]
            )?;
            Ok(removed)
        }).await
    }
}
