use crate::agent::{ ChatAgent, ChatOutcome, EnhancedReply, TurnEvent, TurnStream };
use crate::cli::Args;
use crate::error::{ AgentError, InferenceError, PersistenceError };
use crate::models::chat::ChatRequest;
use axum::{
    extract::{ rejection::JsonRejection, Path, State },
    http::StatusCode,
    response::{ sse::{ Event, KeepAlive, Sse }, IntoResponse, Response },
    routing::{ delete, get, post },
    Json,
    Router,
};
use futures::{ Stream, StreamExt };
use log::{ error, info };
use serde::Serialize;
use serde_json::{ json, Value };
use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<ChatAgent>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_status: Option<u16>,
}

#[derive(Debug)]
pub enum ApiError {
    /// 400, the request body could not be used.
    BadRequest(String),
    /// 502, the inference backend failed.
    Upstream {
        message: String,
        upstream_status: Option<u16>,
    },
    /// 500
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, upstream_status) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::Upstream { message, upstream_status } =>
                (StatusCode::BAD_GATEWAY, "upstream_error", message, upstream_status),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg, None),
        };

        let body = ErrorBody {
            error: code.to_string(),
            message,
            upstream_status,
        };
        (status, Json(body)).into_response()
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        error!("Inference failed: {}", err);
        ApiError::Upstream {
            upstream_status: err.upstream_status(),
            message: err.to_string(),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        error!("History store failed: {}", err);
        ApiError::Internal(err.to_string())
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Inference(e) => e.into(),
            AgentError::Persistence(e) => e.into(),
            AgentError::InvalidRequest(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/models", get(list_models_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/api/chat/enhanced", post(chat_enhanced_handler))
        .route("/api/history/{id}", get(get_history_handler).delete(delete_history_handler))
        .route("/api/conversations", get(list_conversations_handler).post(create_conversation_handler))
        .route("/api/cache", delete(clear_cache_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    agent: Arc<ChatAgent>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.http_addr.parse::<SocketAddr>()?;
    let app = router(AppState { agent });

    if let (true, Some(cert_path), Some(key_path)) = (
        args.enable_tls,
        args.tls_cert_path.as_ref(),
        args.tls_key_path.as_ref(),
    ) {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        tokio::spawn(async move {
            let result = axum_server
                ::bind_rustls(addr, tls_config)
                .serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS API listening on: https://{}", addr);
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                error!("HTTP server error: {}", e);
            }
        });

        info!("HTTP API listening on: http://{}", addr);
    }

    Ok(())
}

fn sse_event(event: TurnEvent) -> Event {
    match event {
        TurnEvent::Chunk(chunk) => Event::default().data(chunk),
        TurnEvent::Status(status) =>
            Event::default()
                .event("status")
                .json_data(&status)
                .unwrap_or_else(|_| Event::default().event("status").data("{}")),
    }
}

fn sse_response(turn: TurnStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(turn.map(|event| Ok(sse_event(event)))).keep_alive(KeepAlive::default())
}

fn buffered_response(outcome: ChatOutcome) -> Json<Value> {
    let mut body = outcome.body;
    if !outcome.diagnostics.is_empty() {
        if let Some(object) = body.as_object_mut() {
            object.insert("diagnostics".to_string(), json!(outcome.diagnostics));
        }
    }
    Json(body)
}

async fn list_models_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state.agent.list_models().await?;
    Ok(Json(json!({ "models": models })))
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let outcome = state.agent.chat(&request).await?;
    Ok(buffered_response(outcome))
}

async fn chat_stream_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let turn = state.agent.stream_chat(request)?;
    Ok(sse_response(turn).into_response())
}

async fn chat_enhanced_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    match state.agent.enhanced_chat(request).await? {
        EnhancedReply::Stream(turn) => Ok(sse_response(turn).into_response()),
        EnhancedReply::Buffered(outcome) => Ok(buffered_response(outcome).into_response()),
    }
}

async fn get_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<Value>, ApiError> {
    let turns = state.agent.history(&id).await?;
    let messages: Vec<Value> = turns
        .into_iter()
        .map(|turn| json!({ "role": turn.role, "content": turn.content, "timestamp": turn.timestamp }))
        .collect();
    Ok(Json(json!({ "messages": messages })))
}

async fn delete_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<Value>, ApiError> {
    let removed = state.agent.delete_history(&id).await?;
    Ok(
        Json(
            json!({
        "status": "success",
        "message": format!("Conversation {} deleted", id),
        "deleted": removed,
    })
        )
    )
}

async fn list_conversations_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let conversations = state.agent.list_conversations().await?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn create_conversation_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "conversation_id": state.agent.create_conversation() }))
}

async fn clear_cache_handler(State(state): State<AppState>) -> Json<Value> {
    let removed = state.agent.clear_cache().await;
    info!("Response cache cleared ({} entries)", removed);
    Json(json!({ "status": "success", "removed": removed }))
}
