//! Thin axum front end over the dispatcher and the health subsystem.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchError, Dispatcher};
use crate::health::{
    Alert, AlertPage, AlertStatus, HealthChecker, HealthStatus, StoreError, TargetType,
};
use crate::types::{ChatRequest, ModelInfo};

pub const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";
const STATUS_CLIENT_CLOSED: u16 = 499;

#[derive(Clone)]
pub struct RelayHttpState {
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthChecker>,
}

impl RelayHttpState {
    pub fn new(dispatcher: Arc<Dispatcher>, health: Arc<HealthChecker>) -> Self {
        Self { dispatcher, health }
    }
}

pub fn router(state: RelayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/:target_type", get(health_by_type))
        .route("/health/:target_type/:target_id", get(health_of_target))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/alerts", get(list_alerts))
        .route("/alerts/:alert_id/acknowledge", post(acknowledge_alert))
        .route("/alerts/:alert_id/resolve", post(resolve_alert))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
}

fn dispatch_error(err: &DispatchError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    match err {
        DispatchError::NoBackend { .. } => openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            Some("no_backend"),
            err,
        ),
        DispatchError::UnknownBackend { .. } => {
            openai_error(StatusCode::NOT_FOUND, "invalid_request_error", Some("unknown_backend"), err)
        }
        DispatchError::Pool(_) => openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            Some("no_credentials"),
            err,
        ),
        DispatchError::Upstream { .. } => {
            openai_error(StatusCode::BAD_GATEWAY, "api_error", Some("upstream_unavailable"), err)
        }
        DispatchError::Cancelled => openai_error(
            StatusCode::from_u16(STATUS_CLIENT_CLOSED).unwrap_or(StatusCode::BAD_REQUEST),
            "request_cancelled",
            None,
            err,
        ),
        DispatchError::Directory(_) => {
            openai_error(StatusCode::INTERNAL_SERVER_ERROR, "api_error", None, err)
        }
    }
}

fn store_error(err: &StoreError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    match err {
        StoreError::NotFound { .. } => {
            openai_error(StatusCode::NOT_FOUND, "invalid_request_error", Some("not_found"), err)
        }
        _ => openai_error(StatusCode::INTERNAL_SERVER_ERROR, "api_error", None, err),
    }
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

fn parse_target_type(raw: &str) -> Result<TargetType, (StatusCode, Json<OpenAiErrorResponse>)> {
    TargetType::parse(raw).ok_or_else(|| {
        openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("invalid_target_type"),
            format!("unknown target type: {raw}"),
        )
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn health_by_type(
    State(state): State<RelayHttpState>,
    Path(target_type): Path<String>,
) -> Result<Json<Vec<HealthStatus>>, (StatusCode, Json<OpenAiErrorResponse>)> {
    let target_type = parse_target_type(&target_type)?;
    state
        .health
        .all_statuses(target_type)
        .await
        .map(Json)
        .map_err(|err| store_error(&err))
}

async fn health_of_target(
    State(state): State<RelayHttpState>,
    Path((target_type, target_id)): Path<(String, String)>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<OpenAiErrorResponse>)> {
    let target_type = parse_target_type(&target_type)?;
    state
        .health
        .target_status(target_type, &target_id)
        .await
        .map(Json)
        .map_err(|err| store_error(&err))
}

async fn chat_completions(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                Some("invalid_json"),
                format!("invalid request body: {err}"),
            )
            .into_response();
        }
    };
    if request.model.trim().is_empty() {
        return openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some("missing_model"),
            "model is required",
        )
        .into_response();
    }

    let user_id = user_id(&headers);
    // Dropping the handler future (client gone) cancels the in-flight attempt.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    if request.stream {
        return match state
            .dispatcher
            .chat_stream(&user_id, &request, &cancel)
            .await
        {
            Ok(frames) => {
                guard.disarm();
                let body = Body::from_stream(frames.map(|frame| frame.map_err(std::io::Error::other)));
                let mut response = Response::new(body);
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("text/event-stream"),
                );
                headers.insert(
                    header::CACHE_CONTROL,
                    header::HeaderValue::from_static("no-cache"),
                );
                response
            }
            Err(err) => dispatch_error(&err).into_response(),
        };
    }

    let result = state.dispatcher.chat(&user_id, &request, &cancel).await;
    drop(guard);
    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => dispatch_error(&err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    backend: Option<String>,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: String,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelEntry>,
}

fn model_entries(models: Vec<ModelInfo>, owned_by: &str) -> impl Iterator<Item = ModelEntry> + '_ {
    models.into_iter().map(move |model| ModelEntry {
        id: model.id,
        object: "model",
        created: model.created,
        owned_by: owned_by.to_string(),
    })
}

async fn list_models(
    State(state): State<RelayHttpState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<ModelsResponse>, (StatusCode, Json<OpenAiErrorResponse>)> {
    let data = match query.backend.as_deref().filter(|id| !id.trim().is_empty()) {
        Some(backend_id) => {
            let models = state
                .dispatcher
                .list_models(backend_id)
                .await
                .map_err(|err| dispatch_error(&err))?;
            model_entries(models, backend_id).collect()
        }
        None => {
            let listings = state
                .dispatcher
                .list_all_models()
                .await
                .map_err(|err| dispatch_error(&err))?;
            let mut data = Vec::new();
            for listing in listings {
                data.extend(model_entries(listing.models, &listing.family));
            }
            data
        }
    };
    Ok(Json(ModelsResponse {
        object: "list",
        data,
    }))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    page: usize,
    #[serde(default)]
    page_size: usize,
}

async fn list_alerts(
    State(state): State<RelayHttpState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertPage>, (StatusCode, Json<OpenAiErrorResponse>)> {
    let status = match query.status.as_deref().filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => Some(AlertStatus::parse(raw).ok_or_else(|| {
            openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                Some("invalid_status"),
                format!("unknown alert status: {raw}"),
            )
        })?),
        None => None,
    };
    state
        .health
        .alerts()
        .list_alerts(status, query.page, query.page_size)
        .await
        .map(Json)
        .map_err(|err| store_error(&err))
}

async fn acknowledge_alert(
    State(state): State<RelayHttpState>,
    Path(alert_id): Path<u64>,
) -> Result<Json<Alert>, (StatusCode, Json<OpenAiErrorResponse>)> {
    state
        .health
        .alerts()
        .acknowledge(alert_id)
        .await
        .map(Json)
        .map_err(|err| store_error(&err))
}

async fn resolve_alert(
    State(state): State<RelayHttpState>,
    Path(alert_id): Path<u64>,
) -> Result<Json<Alert>, (StatusCode, Json<OpenAiErrorResponse>)> {
    state
        .health
        .alerts()
        .resolve(alert_id)
        .await
        .map(Json)
        .map_err(|err| store_error(&err))
}
