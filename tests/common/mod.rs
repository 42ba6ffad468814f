#![allow(dead_code)]

use async_trait::async_trait;
use futures::Stream;
use llm_gateway::agent::ChatAgent;
use llm_gateway::cache::ResponseCache;
use llm_gateway::error::{ InferenceError, RetrievalError };
use llm_gateway::history::sqlite::SqliteHistoryStore;
use llm_gateway::history::HistoryStore;
use llm_gateway::llm::{ ChunkStream, InferenceClient };
use llm_gateway::models::chat::{ Message, ModelInfo };
use llm_gateway::rag::{ FetchedDocument, PageFetcher, RetrievalAugmenter, SearchProvider, SearchResult };
use serde_json::{ json, Value };
use std::pin::Pin;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use std::task::{ Context, Poll };
use std::time::Duration;

pub fn chunk(content: &str) -> String {
    json!({"model": "llama2", "message": {"role": "assistant", "content": content}, "done": false}).to_string()
}

pub fn final_chunk() -> String {
    json!({"model": "llama2", "message": {"role": "assistant", "content": ""}, "done": true}).to_string()
}

/// Scripted inference backend that records what it was asked.
pub struct FakeInference {
    pub reply: Value,
    pub chunks: Vec<String>,
    pub fail_status: Option<u16>,
    /// Keep the stream open after the scripted chunks.
    pub hang: bool,
    pub complete_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub seen: Mutex<Vec<Vec<Message>>>,
    pub stream_dropped: Arc<AtomicBool>,
    pub watch_conversation: Option<String>,
    pub history: Option<Arc<dyn HistoryStore>>,
    /// Turns of `watch_conversation` already stored when the backend was called.
    pub turns_at_call: Mutex<Vec<usize>>,
}

impl FakeInference {
    pub fn new() -> Self {
        Self {
            reply: json!({
                "model": "llama2",
                "message": {"role": "assistant", "content": "Hi there!"},
                "done": true
            }),
            chunks: vec![chunk("Hello"), chunk(" world"), final_chunk()],
            fail_status: None,
            hang: false,
            complete_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
            watch_conversation: None,
            history: None,
            turns_at_call: Mutex::new(Vec::new()),
        }
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }

    async fn note_call(&self, messages: &[Message]) {
        self.seen.lock().unwrap().push(messages.to_vec());
        if let (Some(history), Some(id)) = (&self.history, &self.watch_conversation) {
            let turns = history.list(id).await.unwrap().len();
            self.turns_at_call.lock().unwrap().push(turns);
        }
    }
}

struct TrackedStream {
    inner: ChunkStream,
    dropped: Arc<AtomicBool>,
}

impl Stream for TrackedStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for FakeInference {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        Ok(
            vec![ModelInfo {
                name: "llama2:latest".to_string(),
                size: 3_825_819_519,
                modified_at: "2024-01-01T00:00:00Z".to_string(),
            }]
        )
    }

    async fn complete(&self, _model: &str, messages: &[Message]) -> Result<Value, InferenceError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.note_call(messages).await;
        match self.fail_status {
            Some(status) =>
                Err(InferenceError::Backend {
                    status,
                    message: "backend exploded".to_string(),
                }),
            None => Ok(self.reply.clone()),
        }
    }

    fn complete_stream(&self, _model: &str, messages: &[Message]) -> ChunkStream {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let scripted = futures::stream::iter(self.chunks.clone());
        let inner: ChunkStream = if self.hang {
            Box::pin(futures::StreamExt::chain(scripted, futures::stream::pending()))
        } else {
            Box::pin(scripted)
        };
        Box::pin(TrackedStream { inner, dropped: self.stream_dropped.clone() })
    }
}

pub struct FakeSearch {
    pub results: Result<Vec<SearchResult>, u16>,
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchResult>, RetrievalError> {
        match &self.results {
            Ok(results) => Ok(results.iter().take(limit).cloned().collect()),
            Err(status) => Err(RetrievalError::Status(*status)),
        }
    }
}

pub struct FakeFetcher;

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> FetchedDocument {
        FetchedDocument {
            url: url.to_string(),
            title: "Rust".to_string(),
            text: "Rust is a language.".to_string(),
            main_content: "Rust is a systems programming language.".to_string(),
            status_code: Some(200),
            error: None,
        }
    }
}

pub fn search_results() -> Vec<SearchResult> {
    vec![
        SearchResult {
            title: "Rust Programming Language".to_string(),
            url: "https://www.rust-lang.org/".to_string(),
            snippet: "A language empowering everyone.".to_string(),
            published_date: None,
        },
        SearchResult {
            title: "Rust (programming language) - Wikipedia".to_string(),
            url: "https://en.wikipedia.org/wiki/Rust_(programming_language)".to_string(),
            snippet: "Rust is a general-purpose programming language.".to_string(),
            published_date: None,
        }
    ]
}

pub fn augmenter(results: Result<Vec<SearchResult>, u16>) -> Arc<RetrievalAugmenter> {
    Arc::new(RetrievalAugmenter::new(Arc::new(FakeSearch { results }), Arc::new(FakeFetcher), 5))
}

pub struct Harness {
    pub agent: Arc<ChatAgent>,
    pub inference: Arc<FakeInference>,
    pub history: Arc<SqliteHistoryStore>,
    pub cache: Arc<ResponseCache>,
}

pub fn harness_with(
    configure: impl FnOnce(&mut FakeInference),
    augmenter: Option<Arc<RetrievalAugmenter>>
) -> Harness {
    let history = Arc::new(SqliteHistoryStore::in_memory().unwrap());
    let mut inference = FakeInference::new();
    configure(&mut inference);
    inference.history = Some(history.clone());
    let inference = Arc::new(inference);
    let cache = Arc::new(ResponseCache::in_memory(Duration::from_secs(3600)));
    let agent = Arc::new(
        ChatAgent::new(
            inference.clone(),
            Some(cache.clone()),
            history.clone(),
            augmenter,
            "llama2"
        )
    );
    Harness { agent, inference, history, cache }
}

pub fn harness() -> Harness {
    harness_with(|_| {}, None)
}

/// Polls until `check` holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
    where F: FnMut() -> Fut, Fut: std::future::Future<Output = bool>
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
