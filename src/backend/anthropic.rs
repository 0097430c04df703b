use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{BackendClient, ChatStream, ClientSpec, HealthReport};
use crate::Result;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, Choice, ModelInfo, StreamChunk, Usage};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, join_url, response_text_truncated, send_checked_json};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const PROBE_MODEL: &str = "claude-3-haiku-20240307";
const KNOWN_MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
    pub fn from_spec(spec: ClientSpec<'_>) -> Self {
        Self {
            http: spec.transport.client().clone(),
            base_url: spec.backend.base_url.trim_end_matches('/').to_string(),
            api_key: spec.api_key.unwrap_or_default(),
        }
    }

    fn messages_url(&self) -> String {
        if self.base_url.ends_with("/v1") {
            join_url(&self.base_url, "messages")
        } else {
            join_url(&self.base_url, "v1/messages")
        }
    }

    fn messages_request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
    }

    /// Leading system turns become the top-level `system` field.
    fn messages_body(request: &ChatRequest) -> Value {
        let mut system = Vec::<&str>::new();
        let mut messages = Vec::<Value>::new();
        for message in &request.messages {
            if message.role == "system" && messages.is_empty() {
                system.push(message.content.as_str());
                continue;
            }
            let role = if message.role == "assistant" {
                "assistant"
            } else {
                "user"
            };
            messages.push(serde_json::json!({ "role": role, "content": message.content }));
        }

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(request.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert(
            "max_tokens".to_string(),
            Value::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if !system.is_empty() {
            body.insert("system".to_string(), Value::String(system.join("\n\n")));
        }
        if let Some(temperature) = request.temperature {
            if let Some(number) = serde_json::Number::from_f64(f64::from(temperature)) {
                body.insert("temperature".to_string(), Value::Number(number));
            }
        }
        Value::Object(body)
    }

    fn into_chat_response(parsed: MessagesResponse) -> ChatResponse {
        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();
        let usage = Usage {
            prompt_tokens: parsed.usage.input_tokens,
            completion_tokens: parsed.usage.output_tokens,
            total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
        };
        ChatResponse {
            id: parsed.id,
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new("assistant", text),
                finish_reason: parsed.stop_reason,
            }],
            usage,
        }
    }
}

#[async_trait]
impl BackendClient for AnthropicClient {
    fn family(&self) -> &str {
        "anthropic"
    }

    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = Self::messages_body(request);
        let parsed: MessagesResponse = send_checked_json(self.messages_request(&body)).await?;
        Ok(Self::into_chat_response(parsed))
    }

    /// Delivered as one chunk built from the complete response.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.send_chat(request).await?;
        let chunk = StreamChunk::from_response(&response);
        Ok(Box::pin(stream::iter([Ok(chunk)])))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(KNOWN_MODELS.iter().map(|id| ModelInfo::named(*id)).collect())
    }

    /// A 401 still proves the endpoint is reachable.
    async fn check_health(&self) -> HealthReport {
        let started = Instant::now();
        let mut probe = ChatRequest::new(PROBE_MODEL, vec![ChatMessage::user("Hi")]);
        probe.max_tokens = Some(5);
        let body = Self::messages_body(&probe);
        match self.messages_request(&body).send().await {
            Ok(response)
                if response.status().is_success()
                    || response.status() == reqwest::StatusCode::UNAUTHORIZED =>
            {
                HealthReport::healthy(started.elapsed())
            }
            Ok(response) => {
                let status = response.status();
                let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
                HealthReport::unhealthy(
                    started.elapsed(),
                    format!("health check returned {status}: {body}"),
                )
            }
            Err(err) => HealthReport::unhealthy(started.elapsed(), err.to_string()),
        }
    }
}
