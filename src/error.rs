//! Error types for every layer of the gateway.
//!
//! Only [`InferenceError`] and [`PersistenceError`] ever reach a client;
//! cache and retrieval failures are downgraded to misses and diagnostics by
//! the orchestrator.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt cache record '{key}': {reason}")]
    Corrupt {
        key: String,
        reason: String,
    },
    #[error("cache redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("web search is not configured")]
    Disabled,
    #[error("no search query: supply web_search_query or a user message")]
    EmptyQuery,
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search surface returned status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference backend returned status {status}: {message}")] Backend {
        status: u16,
        message: String,
    },
    #[error("failed to reach inference backend: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("inference backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("could not decode inference backend response: {0}")]
    Decode(String),
}

impl InferenceError {
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            InferenceError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt history record: {0}")]
    Corrupt(String),
    #[error("history store lock poisoned")]
    Poisoned,
    #[error("history task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("history store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)] Inference(#[from] InferenceError),
    #[error(transparent)] Persistence(#[from] PersistenceError),
    #[error("invalid request: {0}")] InvalidRequest(String),
}
