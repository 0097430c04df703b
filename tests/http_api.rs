#![cfg(feature = "server")]

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::{Method::POST, MockServer};
use llm_relay::directory::{Backend, Credential};
use llm_relay::health::{HealthStore, MemoryHealthStore};
use llm_relay::utils::test_support::should_skip_httpmock;
use llm_relay::{MemoryUsageSink, Relay, RelayConfig};
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn relay(backends: Vec<Backend>, credentials: Vec<Credential>) -> (Relay, MemoryUsageSink) {
    let config = RelayConfig {
        backends,
        credentials,
        ..RelayConfig::default()
    };
    let usage = MemoryUsageSink::new();
    let store: Arc<dyn HealthStore> = Arc::new(MemoryHealthStore::new());
    let relay = Relay::from_config(&config, store, Arc::new(usage.clone())).unwrap();
    (relay, usage)
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "user-42")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn completion() -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "pong"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (relay, _) = relay(Vec::new(), Vec::new());
    let app = llm_relay::http::router(relay.http_state());
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn chat_completion_round_trips_and_records_caller() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-live")
                .body_includes("\"model\":\"gpt-4\"");
            then.status(200).json_body(completion());
        })
        .await;

    let (relay, usage) = relay(
        vec![Backend::new("oa", "openai", server.url("/v1"))],
        vec![Credential::new("k1", "oa", "sk-live")],
    );
    let app = llm_relay::http::router(relay.http_state());
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "ping"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    mock.assert_async().await;

    let records = usage.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, "user-42");
    assert_eq!(records[0].total_tokens, 4);
}

#[tokio::test]
async fn streaming_completion_is_framed_as_sse() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"id\":\"s1\",\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"po\"}}]}\n\n",
                    "data: {\"id\":\"s1\",\"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n"
                ));
        })
        .await;

    let (relay, _) = relay(
        vec![Backend::new("oa", "openai", server.url("/v1"))],
        vec![Credential::new("k1", "oa", "sk-live")],
    );
    let app = llm_relay::http::router(relay.http_state());
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            &json!({"model": "gpt-4", "stream": true, "messages": [{"role": "user", "content": "ping"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<&str> = text.split("\n\n").filter(|frame| !frame.is_empty()).collect();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].starts_with("data: {"));
    assert!(frames[1].contains("\"finish_reason\":\"stop\""));
    assert_eq!(frames[2], "data: [DONE]");
}

#[tokio::test]
async fn upstream_failure_is_generic_to_the_caller() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429)
                .body("rate limit exceeded for organization org-secret-123");
        })
        .await;

    let (relay, usage) = relay(
        vec![Backend::new("oa", "openai", server.url("/v1"))],
        vec![Credential::new("k1", "oa", "sk-live")],
    );
    let app = llm_relay::http::router(relay.http_state());
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "ping"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["error"]["message"], "upstream unavailable");
    assert!(!body.to_string().contains("org-secret-123"));

    let records = usage.records().await;
    assert!(
        records[0]
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("org-secret-123"))
    );
}

#[tokio::test]
async fn bad_requests_use_the_openai_error_envelope() {
    let (relay, _) = relay(Vec::new(), Vec::new());
    let app = llm_relay::http::router(relay.http_state());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            &json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "no_backend");
}

#[tokio::test]
async fn model_listing_for_one_backend() {
    let (relay, _) = relay(
        vec![Backend::new("claude", "anthropic", "http://127.0.0.1:9")],
        vec![Credential::new("k1", "claude", "sk-ant")],
    );
    let app = llm_relay::http::router(relay.http_state());

    let response = app
        .clone()
        .oneshot(get("/v1/models?backend=claude"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
    assert_eq!(body["data"][0]["owned_by"], "claude");

    let response = app.oneshot(get("/v1/models?backend=nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn alerts_can_be_listed_acknowledged_and_resolved() {
    let (relay, _) = relay(
        vec![Backend::new("lonely", "openai", "http://127.0.0.1:9/v1")],
        Vec::new(),
    );
    relay.checker().run_cycle().await.unwrap();
    let app = llm_relay::http::router(relay.http_state());

    let response = app
        .clone()
        .oneshot(get("/alerts?status=active"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = json_body(response).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["page"], 1);
    assert_eq!(page["page_size"], 20);
    let id = page["alerts"][0]["id"].as_u64().unwrap();
    assert_eq!(page["alerts"][0]["target_type"], "provider");

    let response = app
        .clone()
        .oneshot(post_json(&format!("/alerts/{id}/acknowledge"), &json!({})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "acknowledged");

    let response = app
        .clone()
        .oneshot(post_json(&format!("/alerts/{id}/resolve"), &json!({})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "resolved");

    let response = app
        .clone()
        .oneshot(post_json(&format!("/alerts/{id}/acknowledge"), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "resolved");

    let response = app
        .clone()
        .oneshot(post_json("/alerts/999/resolve", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/alerts?status=bogus")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_status_by_target_type() {
    let (relay, _) = relay(
        vec![Backend::new("lonely", "openai", "http://127.0.0.1:9/v1")],
        Vec::new(),
    );
    relay.checker().run_cycle().await.unwrap();
    let app = llm_relay::http::router(relay.http_state());

    let response = app.clone().oneshot(get("/health/provider")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let statuses = json_body(response).await;
    assert_eq!(statuses[0]["target_id"], "lonely");
    assert_eq!(statuses[0]["healthy"], false);
    assert_eq!(statuses[0]["success_rate"], 0.0);

    let response = app
        .clone()
        .oneshot(get("/health/api_key/unknown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = json_body(response).await;
    assert_eq!(status["healthy"], true);
    assert_eq!(status["sample_count"], 0);

    let response = app.oneshot(get("/health/widgets")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
