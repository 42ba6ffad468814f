pub mod ollama;

use async_trait::async_trait;
use futures::Stream;
use log::warn;
use serde_json::{ json, Value };
use std::pin::Pin;

use crate::error::InferenceError;
use crate::models::chat::{ Message, ModelInfo };

/// Raw backend chunks, one JSON document per item, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError>;

    /// One buffered completion; the backend's JSON body is returned untouched.
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Value, InferenceError>;

    /// Streaming completion. Failures never surface as an `Err`: the stream
    /// ends with a single [`error_chunk`] instead.
    fn complete_stream(&self, model: &str, messages: &[Message]) -> ChunkStream;
}

/// The chunk emitted in place of a failed stream.
pub fn error_chunk(message: impl Into<String>) -> String {
    json!({ "error": message.into() }).to_string()
}

/// Assistant text carried by a streamed chunk.
///
/// Chunks without `message.content` (final stats, errors) yield `None`.
/// Chunks that are not JSON at all are logged and also yield `None`.
pub fn content_fragment(chunk: &str) -> Option<String> {
    match serde_json::from_str::<Value>(chunk) {
        Ok(value) =>
            value
                .pointer("/message/content")
                .and_then(Value::as_str)
                .map(str::to_string),
        Err(e) => {
            warn!("Malformed chunk from inference backend ({}): {}", e, chunk);
            None
        }
    }
}

/// Whether a chunk marks the end of a generation.
pub fn is_final_chunk(chunk: &str) -> bool {
    serde_json
        ::from_str::<Value>(chunk)
        .ok()
        .and_then(|v| v.get("done").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Assistant text of a buffered response body.
pub fn response_content(body: &Value) -> Option<&str> {
    body.pointer("/message/content").and_then(Value::as_str)
}
