use std::sync::Arc;
use std::time::Duration;

use httpmock::{Method::POST, MockServer};
use llm_relay::clock::ManualClock;
use llm_relay::directory::{Backend, Credential, Directory, EgressProxy, ProxyKind};
use llm_relay::pool::CredentialState;
use llm_relay::secret::plain_codec;
use llm_relay::selector::RandomSource;
use llm_relay::utils::test_support::{heads, should_skip_httpmock, start_answering_proxy};
use llm_relay::{
    BackendRegistry, ChatMessage, ChatRequest, CredentialPool, DispatchConfig, DispatchError,
    Dispatcher, MemoryDirectory, MemoryUsageSink, ModelRouter, RoutingStrategy, TransportBuilder,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Always takes the first eligible item.
struct FirstPick;

impl RandomSource for FirstPick {
    fn unit(&self) -> f64 {
        0.0
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    directory: MemoryDirectory,
    pool: Arc<CredentialPool>,
    usage: MemoryUsageSink,
    clock: Arc<ManualClock>,
}

fn fixture(directory: MemoryDirectory) -> Fixture {
    let shared: Arc<dyn Directory> = Arc::new(directory.clone());
    let clock = Arc::new(ManualClock::new(10_000));
    let pool = Arc::new(
        CredentialPool::new(shared.clone())
            .with_clock(clock.clone())
            .with_random(Arc::new(FirstPick)),
    );
    let usage = MemoryUsageSink::new();
    let router = ModelRouter::with_defaults(RoutingStrategy::Weighted)
        .unwrap()
        .with_random(Arc::new(FirstPick));
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(TransportBuilder::new(shared, plain_codec())),
        Arc::new(BackendRegistry::with_defaults()),
        router,
        Arc::new(usage.clone()),
        plain_codec(),
    )
    .with_clock(clock.clone())
    .with_config(DispatchConfig {
        request_timeout: Duration::from_secs(5),
        ..DispatchConfig::default()
    });
    Fixture {
        dispatcher,
        directory,
        pool,
        usage,
        clock,
    }
}

fn completion() -> serde_json::Value {
    json!({
        "id": "chatcmpl-9",
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}
    })
}

fn gpt4() -> ChatRequest {
    ChatRequest::new("gpt-4", vec![ChatMessage::user("hi")])
}

#[tokio::test]
async fn rate_limited_keys_are_marked_and_third_key_succeeds() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-one");
            then.status(429)
                .json_body(json!({"error": {"message": "Rate limit reached", "type": "requests"}}));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-two");
            then.status(429)
                .json_body(json!({"error": {"message": "You exceeded your current quota", "type": "insufficient_quota"}}));
        })
        .await;
    let third = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-three");
            then.status(200).json_body(completion());
        })
        .await;

    let f = fixture(MemoryDirectory::new(
        vec![
            Backend::new("oa", "openai", server.url("/v1")),
            Backend::new("heavy", "custom", "http://127.0.0.1:9/v1").with_weight(1_000.0),
        ],
        vec![
            Credential::new("k1", "oa", "sk-one"),
            Credential::new("k2", "oa", "sk-two"),
            Credential::new("k3", "oa", "sk-three"),
        ],
        Vec::new(),
    ));

    let response = f
        .dispatcher
        .chat("user-7", &gpt4(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.choices[0].message.content, "hello");
    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;

    assert!(f.pool.is_failed("k1").await);
    assert!(f.pool.is_failed("k2").await);
    assert_eq!(f.pool.state("k3").await, CredentialState::Available);

    let records = f.usage.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, "user-7");
    assert_eq!(records[0].backend_id, "oa");
    assert_eq!(records[0].credential_id.as_deref(), Some("k3"));
    assert_eq!(records[0].status_code, 200);
    assert_eq!(records[0].request_tokens, 4);
    assert_eq!(records[0].response_tokens, 1);

    let used = f.directory.credential("k3").await.unwrap();
    assert_eq!(used.last_used_ms, Some(10_000));
}

#[tokio::test]
async fn marks_expire_after_the_failure_window() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).body("Too Many Requests");
        })
        .await;

    let f = fixture(MemoryDirectory::new(
        vec![Backend::new("oa", "openai", server.url("/v1"))],
        vec![
            Credential::new("k1", "oa", "sk-one"),
            Credential::new("k2", "oa", "sk-two"),
        ],
        Vec::new(),
    ));

    let err = f
        .dispatcher
        .chat("u", &gpt4(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Upstream { .. }));
    assert_eq!(err.to_string(), "upstream unavailable");
    assert!(f.pool.is_failed("k1").await);
    assert!(f.pool.is_failed("k2").await);

    f.clock.advance_millis(5 * 60 * 1_000);
    assert!(!f.pool.is_failed("k1").await);
    assert!(!f.pool.is_failed("k2").await);

    let records = f.usage.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, 502);
}

#[tokio::test]
async fn attempts_stop_at_the_configured_bound() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let limited = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-one");
            then.status(429).body("rate limit");
        })
        .await;
    let _never_reached = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-two");
            then.status(200).json_body(completion());
        })
        .await;

    let directory = MemoryDirectory::new(
        vec![Backend::new("oa", "openai", server.url("/v1"))],
        vec![
            Credential::new("k1", "oa", "sk-one"),
            Credential::new("k2", "oa", "sk-two"),
        ],
        Vec::new(),
    );
    let f = fixture(directory);
    let dispatcher = f.dispatcher.with_config(DispatchConfig {
        max_attempts: 1,
        request_timeout: Duration::from_secs(5),
        ..DispatchConfig::default()
    });

    let err = dispatcher
        .chat("u", &gpt4(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Upstream { .. }));
    limited.assert_async().await;
    assert!(!f.pool.is_failed("k2").await);
}

#[tokio::test]
async fn proxied_backend_feeds_proxy_statistics() {
    if should_skip_httpmock() {
        return;
    }
    let body = r#"{"id":"c","model":"gpt-4","choices":[{"index":0,"message":{"role":"assistant","content":"via proxy"}}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;
    let (proxy_addr, captured) = start_answering_proxy(body).await.unwrap();

    let f = fixture(MemoryDirectory::new(
        vec![
            Backend::new("oa", "openai", "http://api.backend.invalid/v1")
                .with_proxy(Some("egress".to_string())),
        ],
        vec![Credential::new("k1", "oa", "sk-one")],
        vec![EgressProxy::new("egress", proxy_addr.to_string(), ProxyKind::Http)],
    ));

    let response = f
        .dispatcher
        .chat("u", &gpt4(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.choices[0].message.content, "via proxy");

    let seen = heads(&captured);
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("POST http://api.backend.invalid/v1/chat/completions"));

    let proxy = f.directory.proxy("egress").await.unwrap().unwrap();
    assert_eq!(proxy.stats.success_count, 1);
    assert_eq!(proxy.stats.failure_count, 0);
    assert_eq!(proxy.stats.last_checked_ms, Some(10_000));
}
