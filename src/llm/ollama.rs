use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use log::{ debug, warn };
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

use super::{ error_chunk, is_final_chunk, ChunkStream, InferenceClient };
use crate::cli::Args;
use crate::error::InferenceError;
use crate::models::chat::{ Message, ModelInfo, Role };

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    stream_timeout: Duration,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatPayload {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

impl WireMessage {
    fn from_message(message: &Message) -> Self {
        let images = message
            .images()
            .into_iter()
            .filter_map(|data| {
                let encoded = match data.split_once(',') {
                    Some((header, body)) if header.starts_with("data:") => body,
                    _ => data,
                };
                match BASE64.decode(encoded) {
                    Ok(_) => Some(encoded.to_string()),
                    Err(e) => {
                        warn!("Dropping image part that is not valid base64: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self {
            role: message.role,
            content: message.text(),
            images,
        }
    }
}

/// Splits a byte stream into NDJSON lines; a line may span several reads.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = Self::decode(&line) {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        Self::decode(&rest)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() { None } else { Some(line.to_string()) }
    }
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, stream_timeout: Duration, request_timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_timeout,
            request_timeout,
        }
    }

    pub fn from_args(args: &Args) -> Self {
        Self::new(
            args.ollama_url.clone(),
            Duration::from_secs(args.stream_timeout),
            Duration::from_secs(args.request_timeout)
        )
    }

    fn payload(model: &str, messages: &[Message], stream: bool) -> ChatPayload {
        ChatPayload {
            model: model.to_string(),
            messages: messages.iter().map(WireMessage::from_message).collect(),
            stream,
        }
    }

    fn transport_error(&self, e: reqwest::Error, limit: Duration) -> InferenceError {
        if e.is_timeout() { InferenceError::Timeout(limit) } else { InferenceError::Transport(e) }
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.http
            .get(&url)
            .timeout(self.request_timeout)
            .send().await
            .map_err(|e| self.transport_error(e, self.request_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Backend { status: status.as_u16(), message });
        }
        let tags = resp
            .json::<TagsResponse>().await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(tags.models)
    }

    async fn complete(&self, model: &str, messages: &[Message]) -> Result<Value, InferenceError> {
        let url = format!("{}/api/chat", self.base_url);
        let req = Self::payload(model, messages, false);
        let resp = self.http
            .post(&url)
            .json(&req)
            .timeout(self.request_timeout)
            .send().await
            .map_err(|e| self.transport_error(e, self.request_timeout))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Backend { status: status.as_u16(), message });
        }
        let body = resp.bytes().await.map_err(|e| self.transport_error(e, self.request_timeout))?;
        serde_json::from_slice(&body).map_err(|e| InferenceError::Decode(e.to_string()))
    }

    fn complete_stream(&self, model: &str, messages: &[Message]) -> ChunkStream {
        let url = format!("{}/api/chat", self.base_url);
        let req = Self::payload(model, messages, true);
        let client = self.http.clone();
        let wait = self.stream_timeout;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let response = match timeout(wait, client.post(&url).json(&req).send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    let _ = tx.send(error_chunk(format!("failed to reach inference backend: {}", e))).await;
                    return;
                }
                Err(_) => {
                    let _ = tx.send(error_chunk(InferenceError::Timeout(wait).to_string())).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                let err = InferenceError::Backend { status: status.as_u16(), message: detail };
                let _ = tx.send(error_chunk(err.to_string())).await;
                return;
            }

            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::default();
            loop {
                let next = tokio::select! {
                    read = timeout(wait, body.next()) => match read {
                        Ok(next) => next,
                        Err(_) => {
                            let _ = tx.send(error_chunk(InferenceError::Timeout(wait).to_string())).await;
                            return;
                        }
                    },
                    _ = tx.closed() => {
                        debug!("Stream consumer went away, dropping upstream response");
                        return;
                    }
                };
                match next {
                    Some(Ok(bytes)) => {
                        for line in lines.push(&bytes) {
                            let done = is_final_chunk(&line);
                            if tx.send(line).await.is_err() {
                                debug!("Stream consumer went away, dropping upstream response");
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(error_chunk(format!("stream read failed: {}", e))).await;
                        return;
                    }
                    None => {
                        if let Some(line) = lines.finish() {
                            let _ = tx.send(line).await;
                        }
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
