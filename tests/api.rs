mod common;

use axum::body::{ to_bytes, Body };
use axum::http::{ header, Method, Request, StatusCode };
use axum::response::Response;
use axum::Router;
use common::*;
use llm_gateway::history::HistoryStore;
use llm_gateway::server::api::{ router, AppState };
use serde_json::{ json, Value };
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    router(AppState { agent: h.agent.clone() })
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn chat_body(conversation_id: Option<&str>) -> Value {
    json!({
        "model": "llama2",
        "messages": [{"role": "user", "content": "Explain quantum entanglement in simple terms"}],
        "conversation_id": conversation_id,
        "stream": false
    })
}

#[tokio::test]
async fn lists_backend_models() {
    let h = harness();
    let response = app(&h).oneshot(empty_request(Method::GET, "/api/models")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["models"][0]["name"], "llama2:latest");
}

#[tokio::test]
async fn buffered_chat_returns_backend_body() {
    let h = harness();
    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat", chat_body(None))).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"]["content"], "Hi there!");
    assert!(body.get("diagnostics").is_none());
}

#[tokio::test]
async fn backend_failure_maps_to_bad_gateway() {
    let h = harness_with(|inference| {
        inference.fail_status = Some(404);
    }, None);
    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat", chat_body(None))).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "upstream_error");
    assert_eq!(body["upstream_status"], 404);
    assert!(body["message"].as_str().unwrap().contains("backend exploded"));
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let h = harness();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"messages\": [{\"role\": \"robot\"}]}"))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "bad_request");

    let empty = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat", json!({"messages": []}))).await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streaming_chat_frames_chunks_as_sse() {
    let h = harness();
    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat/stream", chat_body(Some("c1")))).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/event-stream")
    );

    let text = body_text(response).await;
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data, vec![chunk("Hello"), chunk(" world"), final_chunk()]);
}

#[tokio::test]
async fn enhanced_stream_emits_status_events() {
    let h = harness_with(|_| {}, Some(augmenter(Ok(search_results()))));
    let mut body = chat_body(None);
    body["stream"] = json!(true);
    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat/enhanced", body)).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let text = body_text(response).await;
    assert!(text.contains("event: status"));
    let first_status = text
        .lines()
        .skip_while(|line| *line != "event: status")
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    let status: Value = serde_json::from_str(first_status).unwrap();
    assert_eq!(status["status"], "searching");
}

#[tokio::test]
async fn enhanced_buffered_reports_search_diagnostics() {
    let h = harness_with(|_| {}, Some(augmenter(Err(502))));
    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat/enhanced", chat_body(None))).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"]["content"], "Hi there!");
    assert!(body["diagnostics"][0].as_str().unwrap().contains("502"));
}

#[tokio::test]
async fn conversation_lifecycle() {
    let h = harness();

    let created = body_json(
        app(&h).oneshot(empty_request(Method::POST, "/api/conversations")).await.unwrap()
    ).await;
    let id = created["conversation_id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 36);

    let response = app(&h)
        .oneshot(json_request(Method::POST, "/api/chat", chat_body(Some(&id)))).await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listing = body_json(
        app(&h).oneshot(empty_request(Method::GET, "/api/conversations")).await.unwrap()
    ).await;
    assert_eq!(listing["conversations"][0]["id"], id.as_str());
    assert_eq!(listing["conversations"][0]["title"], "Explain quantum entanglement i...");

    let history = body_json(
        app(&h)
            .oneshot(empty_request(Method::GET, &format!("/api/history/{}", id))).await
            .unwrap()
    ).await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["content"], "Hi there!");

    let deleted = app(&h)
        .oneshot(empty_request(Method::DELETE, &format!("/api/history/{}", id))).await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    assert_eq!(body_json(deleted).await["deleted"], 2);

    let after = body_json(
        app(&h)
            .oneshot(empty_request(Method::GET, &format!("/api/history/{}", id))).await
            .unwrap()
    ).await;
    assert!(after["messages"].as_array().unwrap().is_empty());

    let unknown = app(&h)
        .oneshot(empty_request(Method::DELETE, "/api/history/never-existed")).await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::OK);
    assert_eq!(body_json(unknown).await["deleted"], 0);
}

#[tokio::test]
async fn clearing_the_cache_forces_a_fresh_completion() {
    let h = harness();
    for _ in 0..2 {
        app(&h)
            .oneshot(json_request(Method::POST, "/api/chat", chat_body(None))).await
            .unwrap();
    }
    assert_eq!(h.inference.complete_calls(), 1);
    assert!(h.history.list_conversations().await.unwrap().is_empty());

    let cleared = body_json(
        app(&h).oneshot(empty_request(Method::DELETE, "/api/cache")).await.unwrap()
    ).await;
    assert_eq!(cleared["removed"], 1);

    app(&h)
        .oneshot(json_request(Method::POST, "/api/chat", chat_body(None))).await
        .unwrap();
    assert_eq!(h.inference.complete_calls(), 2);
}
