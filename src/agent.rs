use crate::cache::{ self, ResponseCache };
use crate::cli::Args;
use crate::error::{ AgentError, InferenceError, PersistenceError, RetrievalError };
use crate::history::{ initialize_history_store, HistoryStore };
use crate::llm::ollama::OllamaClient;
use crate::llm::{ content_fragment, response_content, InferenceClient };
use crate::models::chat::{
    last_user_message,
    ChatRequest,
    ConversationSummary,
    ConversationTurn,
    Message,
    ModelInfo,
    Role,
};
use crate::models::websocket::TurnStatus;
use crate::rag::RetrievalAugmenter;

use futures::{ Stream, StreamExt };
use log::{ debug, error, info, warn };
use serde_json::Value;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Reply to a buffered turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Backend response body, exactly as returned (or as cached).
    pub body: Value,
    pub cached: bool,
    /// Non-fatal problems hit while preparing the turn, such as a failed search.
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Status(TurnStatus),
    /// One backend chunk, forwarded untouched.
    Chunk(String),
}

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

pub enum EnhancedReply {
    Buffered(ChatOutcome),
    Stream(TurnStream),
}

/// Runs chat turns for every transport. Shared as `Arc<ChatAgent>`; it holds
/// no per-turn state, so turns proceed concurrently.
pub struct ChatAgent {
    inference: Arc<dyn InferenceClient>,
    cache: Option<Arc<ResponseCache>>,
    history: Arc<dyn HistoryStore>,
    augmenter: Option<Arc<RetrievalAugmenter>>,
    default_model: String,
}

impl ChatAgent {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        cache: Option<Arc<ResponseCache>>,
        history: Arc<dyn HistoryStore>,
        augmenter: Option<Arc<RetrievalAugmenter>>,
        default_model: impl Into<String>
    ) -> Self {
        Self {
            inference,
            cache,
            history,
            augmenter,
            default_model: default_model.into(),
        }
    }

    pub async fn from_args(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let inference: Arc<dyn InferenceClient> = Arc::new(OllamaClient::from_args(args));
        info!("Inference backend configured: {} (default model {})", args.ollama_url, args.default_model);

        let cache = cache::init(args).await?;
        let history = initialize_history_store(args).await?;
        let augmenter = Arc::new(RetrievalAugmenter::from_args(args));

        Ok(Self::new(inference, cache, history, Some(augmenter), args.default_model.clone()))
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// Logs what the backend can serve. Never fails; a missing backend is
    /// only worth a warning at startup.
    pub async fn probe_backend(&self) {
        match self.inference.list_models().await {
            Ok(models) if models.is_empty() => {
                warn!("Inference backend is reachable but has no models installed");
            }
            Ok(models) => {
                let names: Vec<&str> = models
                    .iter()
                    .map(|m| m.name.as_str())
                    .collect();
                info!("Available models: {}", names.join(", "));
            }
            Err(e) => {
                warn!("Inference backend is not reachable yet: {}", e);
            }
        }
    }

    fn resolve_model<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        let model = request.model.trim();
        if model.is_empty() { &self.default_model } else { model }
    }

    fn validate(request: &ChatRequest) -> Result<(), AgentError> {
        if request.messages.is_empty() {
            return Err(AgentError::InvalidRequest("messages must not be empty".to_string()));
        }
        Ok(())
    }

    /// Buffered turn.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, AgentError> {
        Self::validate(request)?;
        let model = self.resolve_model(request);
        let conversation = request.conversation();

        if let Some(cache) = &self.cache {
            if let Some(body) = cache.get(model, &request.messages).await {
                info!("Cache hit for model {}", model);
                if let Some(id) = conversation {
                    self.record_user_turn(id, &request.messages).await;
                    self.record(id, Role::Assistant, response_content(&body).unwrap_or_default()).await;
                }
                return Ok(ChatOutcome { body, cached: true, diagnostics: Vec::new() });
            }
            debug!("Cache miss for model {}", model);
        }

        if let Some(id) = conversation {
            self.record_user_turn(id, &request.messages).await;
        }

        let mut diagnostics = Vec::new();
        let mut messages = request.messages.clone();
        if request.use_web_search {
            match self.augment(request).await {
                Ok(Some(context)) => messages.push(context),
                Ok(None) => {}
                Err(e) => {
                    warn!("Continuing without web context: {}", e);
                    diagnostics.push(e.to_string());
                }
            }
        }

        let body = self.inference.complete(model, &messages).await?;

        if let Some(cache) = &self.cache {
            cache.put(model, &request.messages, &body).await;
        }
        if let Some(id) = conversation {
            self.record(id, Role::Assistant, response_content(&body).unwrap_or_default()).await;
        }

        Ok(ChatOutcome { body, cached: false, diagnostics })
    }

    /// Streaming turn. Events are relayed through a single-slot channel, so
    /// a slow consumer holds back the upstream read. Dropping the returned
    /// stream cancels the upstream request.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest) -> Result<TurnStream, AgentError> {
        Self::validate(&request)?;
        let agent = Arc::clone(self);
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            agent.run_stream_turn(request, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Turn with web search forced on; `request.stream` picks the reply shape.
    pub async fn enhanced_chat(
        self: &Arc<Self>,
        mut request: ChatRequest
    ) -> Result<EnhancedReply, AgentError> {
        request.use_web_search = true;
        if request.stream {
            Ok(EnhancedReply::Stream(self.stream_chat(request)?))
        } else {
            Ok(EnhancedReply::Buffered(self.chat(&request).await?))
        }
    }

    async fn run_stream_turn(&self, request: ChatRequest, tx: mpsc::Sender<TurnEvent>) {
        let model = self.resolve_model(&request).to_string();
        let conversation = request.conversation().map(str::to_string);

        if let Some(id) = &conversation {
            self.record_user_turn(id, &request.messages).await;
        }

        let mut messages = request.messages.clone();
        if request.use_web_search {
            let status = match self.search_target(&request) {
                Ok((augmenter, query)) => {
                    let searching = TurnStatus::Searching { query: query.clone() };
                    if tx.send(TurnEvent::Status(searching)).await.is_err() {
                        return;
                    }
                    match augmenter.augment(&query).await {
                        Ok(augmentation) => {
                            messages.extend(augmentation.message);
                            TurnStatus::SearchComplete { results: augmentation.result_count }
                        }
                        Err(e) => {
                            warn!("Continuing without web context: {}", e);
                            TurnStatus::SearchError { message: e.to_string() }
                        }
                    }
                }
                Err(e) => {
                    warn!("Continuing without web context: {}", e);
                    TurnStatus::SearchError { message: e.to_string() }
                }
            };
            if tx.send(TurnEvent::Status(status)).await.is_err() {
                return;
            }
            if tx.send(TurnEvent::Status(TurnStatus::Generating)).await.is_err() {
                return;
            }
        }

        let mut upstream = self.inference.complete_stream(&model, &messages);
        let mut content = String::new();
        loop {
            // Stop as soon as the consumer is gone, even while the backend is silent.
            let next = tokio::select! {
                next = upstream.next() => next,
                _ = tx.closed() => {
                    info!("Client went away while waiting on the backend, cancelling upstream generation");
                    break;
                }
            };
            let Some(chunk) = next else {
                break;
            };
            if let Some(fragment) = content_fragment(&chunk) {
                content.push_str(&fragment);
            }
            if tx.send(TurnEvent::Chunk(chunk)).await.is_err() {
                info!("Client went away mid-stream, cancelling upstream generation");
                break;
            }
        }
        drop(upstream);

        if let Some(id) = &conversation {
            if !content.is_empty() {
                self.record(id, Role::Assistant, &content).await;
            }
        }
    }

    async fn augment(&self, request: &ChatRequest) -> Result<Option<Message>, RetrievalError> {
        let (augmenter, query) = self.search_target(request)?;
        Ok(augmenter.augment(&query).await?.message)
    }

    fn search_target(
        &self,
        request: &ChatRequest
    ) -> Result<(Arc<RetrievalAugmenter>, String), RetrievalError> {
        let augmenter = self.augmenter.clone().ok_or(RetrievalError::Disabled)?;
        let query = search_query(request).ok_or(RetrievalError::EmptyQuery)?;
        Ok((augmenter, query))
    }

    async fn record_user_turn(&self, conversation_id: &str, messages: &[Message]) {
        match last_user_message(messages) {
            Some(message) => self.record(conversation_id, Role::User, &message.text()).await,
            None => debug!("No user message to record for {}", conversation_id),
        }
    }

    async fn record(&self, conversation_id: &str, role: Role, content: &str) {
        if let Err(e) = self.history.append(conversation_id, role, content).await {
            error!("Failed to persist {} turn for {}: {}", role, conversation_id, e);
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        self.inference.list_models().await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, PersistenceError> {
        self.history.list_conversations().await
    }

    pub async fn history(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, PersistenceError> {
        self.history.list(conversation_id).await
    }

    pub async fn delete_history(&self, conversation_id: &str) -> Result<usize, PersistenceError> {
        let removed = self.history.delete(conversation_id).await?;
        info!("Deleted {} turns of conversation {}", removed, conversation_id);
        Ok(removed)
    }

    /// A fresh conversation id. Nothing is stored until the first turn.
    pub fn create_conversation(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Empties the response cache; 0 when caching is off.
    pub async fn clear_cache(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => 0,
        }
    }
}

/// Explicit query if given, otherwise the text of the last user message.
fn search_query(request: &ChatRequest) -> Option<String> {
    request.web_search_query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .or_else(|| {
            last_user_message(&request.messages)
                .map(|m| m.text().trim().to_string())
                .filter(|q| !q.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_query_wins_over_user_message() {
        let request = ChatRequest::new("", vec![Message::user("what is rust")]);
        assert_eq!(search_query(&request).as_deref(), Some("what is rust"));

        let explicit = request.clone().with_web_search(Some("rust language".to_string()));
        assert_eq!(search_query(&explicit).as_deref(), Some("rust language"));

        let blank = request.with_web_search(Some("   ".to_string()));
        assert_eq!(search_query(&blank).as_deref(), Some("what is rust"));

        let none = ChatRequest::new("", vec![Message::system("only system")]);
        assert_eq!(search_query(&none), None);
    }
}
