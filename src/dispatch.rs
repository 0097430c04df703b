//! Per-request orchestration: backend resolution, the credential retry loop,
//! streaming relay, usage accounting and cached model listings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, BackendRegistry, ChatStream};
use crate::clock::{Clock, SystemClock};
use crate::directory::{Backend, Credential, Directory, DirectoryError, UsageRecord, UsageSink};
use crate::pool::{CredentialPool, PoolError, is_quota_or_rate_limit};
use crate::routing::ModelRouter;
use crate::secret::SharedSecretCodec;
use crate::transport::TransportBuilder;
use crate::types::{ChatRequest, ChatResponse, ModelInfo, Usage};
use crate::utils::sse::{done_event, encode_event};
use crate::{RelayError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MODEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(3);

const STATUS_OK: u16 = 200;
const STATUS_CANCELLED: u16 = 499;
const STATUS_BAD_GATEWAY: u16 = 502;
const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no active backend available for model {model}")]
    NoBackend { model: String },
    #[error("unknown backend {backend_id}")]
    UnknownBackend { backend_id: String },
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The detail goes to the usage sink and logs; callers only see the
    /// generic message.
    #[error("upstream unavailable")]
    Upstream { detail: String },
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl DispatchError {
    fn usage_status(&self) -> u16 {
        match self {
            Self::Cancelled => STATUS_CANCELLED,
            Self::Upstream { .. } => STATUS_BAD_GATEWAY,
            _ => STATUS_UNAVAILABLE,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Upstream { detail } => detail.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub model_cache_ttl: Duration,
    pub listing_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            model_cache_ttl: DEFAULT_MODEL_CACHE_TTL,
            listing_timeout: DEFAULT_LISTING_TIMEOUT,
        }
    }
}

/// SSE frames ready to write to the caller, ending with `data: [DONE]`.
pub type FrameStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendModels {
    pub backend_id: String,
    pub family: String,
    pub models: Vec<ModelInfo>,
}

struct CachedModels {
    fetched_at_ms: u64,
    models: Vec<ModelInfo>,
}

/// How one backend's credential loop ended without a response.
enum BackendFailure {
    /// Lookup or configuration problem before any upstream call.
    Setup(DispatchError),
    Exhausted {
        credential_id: Option<String>,
        detail: String,
    },
    Cancelled {
        credential_id: Option<String>,
    },
}

/// Who and what a usage record is about.
struct UsageContext {
    user_id: String,
    backend_id: String,
    model: String,
    started: Instant,
}

impl UsageContext {
    fn record(
        &self,
        credential_id: Option<String>,
        usage: Usage,
        status_code: u16,
        error_message: Option<String>,
    ) -> UsageRecord {
        UsageRecord {
            user_id: self.user_id.clone(),
            credential_id,
            backend_id: self.backend_id.clone(),
            model: self.model.clone(),
            request_tokens: usage.prompt_tokens,
            response_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            latency_ms: elapsed_ms(self.started),
            status_code,
            error_message,
        }
    }
}

pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    pool: Arc<CredentialPool>,
    transports: Arc<TransportBuilder>,
    registry: Arc<BackendRegistry>,
    router: ModelRouter,
    usage: Arc<dyn UsageSink>,
    codec: SharedSecretCodec,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    model_cache: RwLock<HashMap<String, CachedModels>>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        transports: Arc<TransportBuilder>,
        registry: Arc<BackendRegistry>,
        router: ModelRouter,
        usage: Arc<dyn UsageSink>,
        codec: SharedSecretCodec,
    ) -> Self {
        Self {
            directory: pool.directory().clone(),
            pool,
            transports,
            registry,
            router,
            usage,
            codec,
            clock: Arc::new(SystemClock),
            config: DispatchConfig::default(),
            model_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Candidate backends for `model`, in the order they will be tried.
    pub async fn resolve_backends(&self, model: &str) -> std::result::Result<Vec<Backend>, DispatchError> {
        let backends = self.directory.active_backends().await?;
        let candidates = self.router.candidates(model, &backends);
        if candidates.is_empty() {
            return Err(DispatchError::NoBackend {
                model: model.to_string(),
            });
        }
        Ok(candidates)
    }

    /// Sends one chat request, failing over across credentials (and, for the
    /// fallback strategy, across backends). Usage is recorded exactly once.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, model = %request.model))]
    pub async fn chat(
        &self,
        user_id: &str,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChatResponse, DispatchError> {
        let started = Instant::now();
        let mut ctx = UsageContext {
            user_id: user_id.to_string(),
            backend_id: String::new(),
            model: request.model.clone(),
            started,
        };

        let candidates = match self.resolve_backends(&request.model).await {
            Ok(candidates) => candidates,
            Err(err) => {
                self.record_usage(ctx.record(None, Usage::default(), err.usage_status(), Some(err.detail())))
                    .await;
                return Err(err);
            }
        };

        let mut last_failure = None;
        for backend in &candidates {
            ctx.backend_id = backend.id.clone();
            let outcome = self
                .run_credential_loop(backend, cancel, |client| {
                    let request = request.clone();
                    async move { client.send_chat(&request).await }
                })
                .await;
            match outcome {
                Ok((response, credential_id)) => {
                    self.record_usage(ctx.record(credential_id, response.usage, STATUS_OK, None))
                        .await;
                    return Ok(response);
                }
                Err(BackendFailure::Cancelled { credential_id }) => {
                    let err = DispatchError::Cancelled;
                    self.record_usage(ctx.record(
                        credential_id,
                        Usage::default(),
                        err.usage_status(),
                        Some(err.detail()),
                    ))
                    .await;
                    return Err(err);
                }
                Err(failure) => {
                    if candidates.len() > 1 {
                        tracing::warn!(backend_id = %backend.id, "backend exhausted, trying next");
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let (credential_id, err) = Self::give_up(last_failure, &request.model);
        self.record_usage(ctx.record(
            credential_id,
            Usage::default(),
            err.usage_status(),
            Some(err.detail()),
        ))
        .await;
        Err(err)
    }

    /// Streaming variant of [`Self::chat`]. Failover happens while the upstream
    /// stream is being opened; once chunks flow they are relayed as-is and
    /// usage is recorded when the stream ends or the caller goes away.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, model = %request.model))]
    pub async fn chat_stream(
        &self,
        user_id: &str,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<FrameStream, DispatchError> {
        let started = Instant::now();
        let mut ctx = UsageContext {
            user_id: user_id.to_string(),
            backend_id: String::new(),
            model: request.model.clone(),
            started,
        };

        let candidates = match self.resolve_backends(&request.model).await {
            Ok(candidates) => candidates,
            Err(err) => {
                self.record_usage(ctx.record(None, Usage::default(), err.usage_status(), Some(err.detail())))
                    .await;
                return Err(err);
            }
        };

        let mut last_failure = None;
        for backend in &candidates {
            ctx.backend_id = backend.id.clone();
            let outcome = self
                .run_credential_loop(backend, cancel, |client| {
                    let mut request = request.clone();
                    request.stream = true;
                    async move { client.stream_chat(&request).await }
                })
                .await;
            match outcome {
                Ok((upstream, credential_id)) => {
                    return Ok(self.relay_stream(upstream, ctx, credential_id, cancel.clone()));
                }
                Err(BackendFailure::Cancelled { credential_id }) => {
                    let err = DispatchError::Cancelled;
                    self.record_usage(ctx.record(
                        credential_id,
                        Usage::default(),
                        err.usage_status(),
                        Some(err.detail()),
                    ))
                    .await;
                    return Err(err);
                }
                Err(failure) => last_failure = Some(failure),
            }
        }

        let (credential_id, err) = Self::give_up(last_failure, &request.model);
        self.record_usage(ctx.record(
            credential_id,
            Usage::default(),
            err.usage_status(),
            Some(err.detail()),
        ))
        .await;
        Err(err)
    }

    fn give_up(
        last_failure: Option<BackendFailure>,
        model: &str,
    ) -> (Option<String>, DispatchError) {
        match last_failure {
            Some(BackendFailure::Setup(err)) => (None, err),
            Some(BackendFailure::Exhausted {
                credential_id,
                detail,
            }) => (credential_id, DispatchError::Upstream { detail }),
            Some(BackendFailure::Cancelled { credential_id }) => {
                (credential_id, DispatchError::Cancelled)
            }
            None => (
                None,
                DispatchError::NoBackend {
                    model: model.to_string(),
                },
            ),
        }
    }

    /// Runs `call` with one credential after another until it succeeds, the
    /// attempt bound is reached, or no untried credential is left. Attempts are
    /// strictly sequential so each sees the marks left by the previous one.
    async fn run_credential_loop<T, F, Fut>(
        &self,
        backend: &Backend,
        cancel: &CancellationToken,
        call: F,
    ) -> std::result::Result<(T, Option<String>), BackendFailure>
    where
        F: Fn(Arc<dyn BackendClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !backend.requires_credential {
            return match self.attempt(backend, None, cancel, &call).await {
                Ok(Some(value)) => Ok((value, None)),
                Ok(None) => Err(BackendFailure::Cancelled {
                    credential_id: None,
                }),
                Err(err) => Err(BackendFailure::Exhausted {
                    credential_id: None,
                    detail: err.to_string(),
                }),
            };
        }

        let mut credential = self
            .pool
            .select_credential(&backend.id)
            .await
            .map_err(|err| BackendFailure::Setup(err.into()))?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut detail = String::new();

        for attempt in 1..=max_attempts {
            tracing::debug!(
                backend_id = %backend.id,
                credential_id = %credential.id,
                credential_prefix = %credential.prefix,
                attempt,
                "dispatch attempt"
            );
            let result = match self.codec.decode(&credential.secret) {
                Ok(api_key) => self.attempt(backend, Some(api_key), cancel, &call).await,
                Err(err) => Err(RelayError::InvalidResponse(format!(
                    "credential {} could not be decoded: {err}",
                    credential.id
                ))),
            };

            match result {
                Ok(Some(value)) => {
                    self.on_success(&credential).await;
                    return Ok((value, Some(credential.id)));
                }
                Ok(None) => {
                    tracing::info!(credential_id = %credential.id, "request cancelled mid-retry");
                    return Err(BackendFailure::Cancelled {
                        credential_id: Some(credential.id),
                    });
                }
                Err(err) => {
                    detail = err.to_string();
                    tracing::warn!(
                        backend_id = %backend.id,
                        credential_id = %credential.id,
                        attempt,
                        error = %detail,
                        "upstream attempt failed"
                    );
                    if is_quota_or_rate_limit(&detail) {
                        self.pool.mark_failed(&credential.id, detail.clone()).await;
                    }
                }
            }

            if attempt == max_attempts {
                break;
            }
            match self
                .pool
                .select_next_credential(&backend.id, &credential.id)
                .await
            {
                Ok(next) => credential = next,
                Err(err) => {
                    tracing::debug!(backend_id = %backend.id, error = %err, "no further credential");
                    break;
                }
            }
        }

        Err(BackendFailure::Exhausted {
            credential_id: Some(credential.id),
            detail,
        })
    }

    /// One upstream call. `Ok(None)` means the caller cancelled.
    async fn attempt<T, F, Fut>(
        &self,
        backend: &Backend,
        api_key: Option<String>,
        cancel: &CancellationToken,
        call: &F,
    ) -> Result<Option<T>>
    where
        F: Fn(Arc<dyn BackendClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let work = async {
            let transport = self.transports.for_backend(backend).await?;
            let proxy_id = transport.proxy_id().map(str::to_string);
            let client = self.registry.build(backend, api_key, Some(transport))?;
            let result = match tokio::time::timeout(self.config.request_timeout, call(client)).await
            {
                Ok(result) => result,
                Err(_) => Err(RelayError::Timeout(self.config.request_timeout)),
            };
            if let Some(proxy_id) = proxy_id {
                self.record_proxy(&proxy_id, result.is_ok(), started).await;
            }
            result
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = work => result.map(Some),
        }
    }

    async fn on_success(&self, credential: &Credential) {
        self.pool.clear_failure(&credential.id).await;
        if let Err(err) = self
            .directory
            .touch_credential(&credential.id, self.clock.now_millis())
            .await
        {
            tracing::warn!(credential_id = %credential.id, error = %err, "failed to update credential usage");
        }
    }

    async fn record_proxy(&self, proxy_id: &str, success: bool, started: Instant) {
        if let Err(err) = self
            .directory
            .record_proxy_result(proxy_id, success, elapsed_ms(started), self.clock.now_millis())
            .await
        {
            tracing::warn!(proxy_id, error = %err, "failed to record proxy stats");
        }
    }

    async fn record_usage(&self, record: UsageRecord) {
        if let Err(err) = self.usage.record(record).await {
            tracing::warn!(error = %err, "failed to record usage");
        }
    }

    /// Pumps upstream chunks into SSE frames on a background task.
    fn relay_stream(
        &self,
        mut upstream: ChatStream,
        ctx: UsageContext,
        credential_id: Option<String>,
        cancel: CancellationToken,
    ) -> FrameStream {
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(16);
        let usage_sink = Arc::clone(&self.usage);
        tokio::spawn(async move {
            let mut usage = Usage::default();
            let mut failure: Option<(u16, String)> = None;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        failure = Some((STATUS_CANCELLED, "request cancelled".to_string()));
                        break;
                    }
                    next = upstream.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        if let Some(chunk_usage) = &chunk.usage {
                            usage.merge(chunk_usage);
                        }
                        let frame = encode_event(&chunk);
                        if tx.send(frame).await.is_err() {
                            failure = Some((STATUS_CANCELLED, "client disconnected".to_string()));
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let detail = err.to_string();
                        tracing::warn!(error = %detail, "upstream stream failed");
                        let _ = tx.send(Err(err)).await;
                        failure = Some((STATUS_BAD_GATEWAY, detail));
                        break;
                    }
                    None => {
                        let _ = tx.send(Ok(done_event())).await;
                        break;
                    }
                }
            }

            let record = match failure {
                Some((status, detail)) => ctx.record(credential_id, usage, status, Some(detail)),
                None => ctx.record(credential_id, usage, STATUS_OK, None),
            };
            if let Err(err) = usage_sink.record(record).await {
                tracing::warn!(error = %err, "failed to record usage");
            }
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// Models served by one backend, read through a short-lived cache.
    pub async fn list_models(
        &self,
        backend_id: &str,
    ) -> std::result::Result<Vec<ModelInfo>, DispatchError> {
        let now_ms = self.clock.now_millis();
        let ttl_ms = u64::try_from(self.config.model_cache_ttl.as_millis()).unwrap_or(u64::MAX);
        {
            let cache = self.model_cache.read().await;
            if let Some(cached) = cache.get(backend_id) {
                if now_ms.saturating_sub(cached.fetched_at_ms) < ttl_ms {
                    return Ok(cached.models.clone());
                }
            }
        }

        let backend = self
            .directory
            .backend(backend_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownBackend {
                backend_id: backend_id.to_string(),
            })?;
        let models = self.fetch_models(&backend).await?;
        self.model_cache.write().await.insert(
            backend_id.to_string(),
            CachedModels {
                fetched_at_ms: now_ms,
                models: models.clone(),
            },
        );
        Ok(models)
    }

    async fn fetch_models(
        &self,
        backend: &Backend,
    ) -> std::result::Result<Vec<ModelInfo>, DispatchError> {
        let api_key = if backend.requires_credential {
            let credential = self.pool.select_credential(&backend.id).await?;
            Some(self.codec.decode(&credential.secret).map_err(|err| {
                DispatchError::Upstream {
                    detail: err.to_string(),
                }
            })?)
        } else {
            None
        };
        let upstream = |err: RelayError| DispatchError::Upstream {
            detail: err.to_string(),
        };
        let transport = self
            .transports
            .for_backend(backend)
            .await
            .map_err(|err| upstream(err.into()))?;
        let client = self
            .registry
            .build(backend, api_key, Some(transport))
            .map_err(upstream)?;
        match tokio::time::timeout(self.config.listing_timeout, client.list_models()).await {
            Ok(result) => result.map_err(upstream),
            Err(_) => Err(upstream(RelayError::Timeout(self.config.listing_timeout))),
        }
    }

    /// Lists every active backend's models concurrently, one task per backend.
    /// Backends that fail or time out are left out.
    pub async fn list_all_models(self: &Arc<Self>) -> std::result::Result<Vec<BackendModels>, DispatchError> {
        let backends = self.directory.active_backends().await?;
        let (tx, mut rx) = mpsc::channel(backends.len().max(1));
        for backend in &backends {
            let this = Arc::clone(self);
            let tx = tx.clone();
            let backend_id = backend.id.clone();
            let family = backend.name.clone();
            tokio::spawn(async move {
                let listing = tokio::time::timeout(
                    this.config.listing_timeout,
                    this.list_models(&backend_id),
                )
                .await;
                let _ = tx.send((backend_id, family, listing)).await;
            });
        }
        drop(tx);

        let mut by_id = HashMap::new();
        while let Some((backend_id, family, listing)) = rx.recv().await {
            match listing {
                Ok(Ok(models)) => {
                    by_id.insert(
                        backend_id.clone(),
                        BackendModels {
                            backend_id,
                            family,
                            models,
                        },
                    );
                }
                Ok(Err(err)) => {
                    tracing::warn!(backend_id = %backend_id, error = %err.detail(), "model listing failed");
                }
                Err(_) => {
                    tracing::warn!(backend_id = %backend_id, "model listing timed out");
                }
            }
        }

        Ok(backends
            .iter()
            .filter_map(|backend| by_id.remove(&backend.id))
            .collect())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
