use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{BackendClient, ChatStream, ClientSpec, HealthReport};
use crate::types::{ChatRequest, ChatResponse, ModelInfo, StreamChunk};
use crate::utils::http::{
    MAX_ERROR_BODY_BYTES, join_url, response_text_truncated, send_checked, send_checked_json,
};
use crate::utils::sse::sse_data_stream_from_response;
use crate::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    None,
}

/// Client for any backend speaking the `/chat/completions` + `/models` dialect.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    family: String,
    api_base: String,
    health_url: String,
    api_key: Option<String>,
    auth: AuthStyle,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    created: i64,
}

impl OpenAiCompatibleClient {
    pub fn from_spec(spec: ClientSpec<'_>, auth: AuthStyle) -> Self {
        let api_base = spec.backend.base_url.trim_end_matches('/').to_string();
        Self {
            http: spec.transport.client().clone(),
            family: spec.backend.name.clone(),
            health_url: join_url(&api_base, "models"),
            api_base,
            api_key: spec.api_key,
            auth,
        }
    }

    /// Ollama serves the compatible API under `/v1` and its own liveness
    /// listing at `/api/tags` on the server root.
    pub fn ollama(spec: ClientSpec<'_>) -> Self {
        let trimmed = spec.backend.base_url.trim_end_matches('/');
        let root = trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string();
        Self {
            http: spec.transport.client().clone(),
            family: spec.backend.name.clone(),
            api_base: join_url(&root, "v1"),
            health_url: join_url(&root, "api/tags"),
            api_key: None,
            auth: AuthStyle::None,
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (self.auth, self.api_key.as_deref()) {
            (AuthStyle::Bearer, Some(key)) if !key.trim().is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    fn chat_body(request: &ChatRequest, stream: bool) -> Value {
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(request.model.clone()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Array(Vec::new())),
        );
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            if let Some(number) = serde_json::Number::from_f64(f64::from(temperature)) {
                body.insert("temperature".to_string(), Value::Number(number));
            }
        }
        body.insert("stream".to_string(), Value::Bool(stream));
        Value::Object(body)
    }
}

#[async_trait]
impl BackendClient for OpenAiCompatibleClient {
    fn family(&self) -> &str {
        &self.family
    }

    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let req = self
            .http
            .post(join_url(&self.api_base, "chat/completions"))
            .json(&Self::chat_body(request, false));
        send_checked_json(self.apply_auth(req)).await
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let req = self
            .http
            .post(join_url(&self.api_base, "chat/completions"))
            .header("accept", "text/event-stream")
            .json(&Self::chat_body(request, true));
        let response = send_checked(self.apply_auth(req)).await?;
        let chunks = sse_data_stream_from_response(response).map(|item| {
            let data = item?;
            serde_json::from_str::<StreamChunk>(&data).map_err(|err| {
                RelayError::InvalidResponse(format!("invalid stream chunk: {err}: {data}"))
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let req = self.http.get(join_url(&self.api_base, "models"));
        let parsed: ModelsResponse = send_checked_json(self.apply_auth(req)).await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| ModelInfo {
                name: entry.id.clone(),
                id: entry.id,
                created: entry.created,
            })
            .collect())
    }

    async fn check_health(&self) -> HealthReport {
        let started = Instant::now();
        let req = self.apply_auth(self.http.get(&self.health_url));
        match req.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
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
