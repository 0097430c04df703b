use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{
    AlertManager, DEFAULT_SAMPLE_WINDOW, HealthSample, HealthStatus, HealthStore, StoreError,
    TargetType,
};
use crate::backend::{BackendRegistry, HealthReport};
use crate::clock::{Clock, SystemClock};
use crate::directory::{Backend, Credential, Directory, DirectoryError, EgressProxy};
use crate::secret::SharedSecretCodec;
use crate::transport::TransportBuilder;

pub const DEFAULT_PROBE_URL: &str = "https://ip.plz.ac";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub probe_timeout: Duration,
    /// Fetched through each proxy to prove it forwards traffic.
    pub probe_url: String,
    pub sample_window: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub checked: usize,
    pub unhealthy: usize,
}

pub struct HealthChecker {
    directory: Arc<dyn Directory>,
    registry: Arc<BackendRegistry>,
    transports: Arc<TransportBuilder>,
    codec: SharedSecretCodec,
    store: Arc<dyn HealthStore>,
    alerts: Arc<AlertManager>,
    clock: Arc<dyn Clock>,
    config: HealthCheckerConfig,
}

impl HealthChecker {
    pub fn new(
        directory: Arc<dyn Directory>,
        registry: Arc<BackendRegistry>,
        transports: Arc<TransportBuilder>,
        codec: SharedSecretCodec,
        store: Arc<dyn HealthStore>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            directory,
            registry,
            transports,
            codec,
            store,
            alerts,
            clock: Arc::new(SystemClock),
            config: HealthCheckerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HealthCheckerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// One sequential pass over every credential, every proxy and every
    /// active backend.
    pub async fn run_cycle(&self) -> Result<CycleSummary, DirectoryError> {
        let mut summary = CycleSummary::default();
        let mut tally = |sample: HealthSample| {
            summary.checked += 1;
            if !sample.healthy {
                summary.unhealthy += 1;
            }
        };

        for credential in self.directory.all_credentials().await? {
            tally(self.check_credential(&credential).await);
        }
        for proxy in self.directory.proxies().await? {
            tally(self.check_proxy(&proxy).await);
        }
        for backend in self.directory.active_backends().await? {
            tally(self.check_backend(&backend).await);
        }

        tracing::info!(
            checked = summary.checked,
            unhealthy = summary.unhealthy,
            "health check cycle finished"
        );
        Ok(summary)
    }

    pub async fn check_credential(&self, credential: &Credential) -> HealthSample {
        let report = match self.directory.backend(&credential.backend_id).await {
            Ok(Some(backend)) => match self.codec.decode(&credential.secret) {
                Ok(api_key) => self.probe_backend(&backend, Some(api_key)).await,
                Err(err) => HealthReport::unhealthy(Duration::ZERO, err.to_string()),
            },
            Ok(None) => HealthReport::unhealthy(
                Duration::ZERO,
                format!("backend {} not found", credential.backend_id),
            ),
            Err(err) => HealthReport::unhealthy(Duration::ZERO, err.to_string()),
        };
        self.finish(TargetType::Credential, &credential.id, report, |_| {
            "API key health check failed".to_string()
        })
        .await
    }

    pub async fn check_proxy(&self, proxy: &EgressProxy) -> HealthSample {
        let report = self.probe_proxy(proxy).await;
        let latency_ms = duration_ms(report.latency);
        if let Err(err) = self
            .directory
            .record_proxy_result(&proxy.id, report.healthy, latency_ms, self.clock.now_millis())
            .await
        {
            tracing::warn!(proxy_id = %proxy.id, error = %err, "failed to record proxy stats");
        }
        self.finish(TargetType::Proxy, &proxy.id, report, |_| {
            "Proxy health check failed".to_string()
        })
        .await
    }

    pub async fn check_backend(&self, backend: &Backend) -> HealthSample {
        let report = match self.probe_key(backend).await {
            Ok(api_key) => self.probe_backend(backend, api_key).await,
            Err(message) => HealthReport::unhealthy(Duration::ZERO, message),
        };
        self.finish(TargetType::Backend, &backend.id, report, |error| {
            format!("Provider health check failed: {error}")
        })
        .await
    }

    /// Status of one target over the most recent samples.
    pub async fn target_status(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<HealthStatus, StoreError> {
        let samples = self
            .store
            .recent_samples(target_type, target_id, self.config.sample_window)
            .await?;
        Ok(HealthStatus::from_samples(target_type, target_id, &samples))
    }

    /// Status of every known target of one type.
    pub async fn all_statuses(
        &self,
        target_type: TargetType,
    ) -> Result<Vec<HealthStatus>, StoreError> {
        let ids = self.target_ids(target_type).await.map_err(|err| {
            StoreError::Invalid(format!("failed to list {target_type} targets: {err}"))
        })?;
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(self.target_status(target_type, &id).await?);
        }
        Ok(statuses)
    }

    /// A target with no samples counts as healthy.
    pub async fn is_healthy(&self, target_type: TargetType, target_id: &str) -> bool {
        match self.target_status(target_type, target_id).await {
            Ok(status) => status.healthy,
            Err(err) => {
                tracing::warn!(%target_type, target_id, error = %err, "health lookup failed");
                true
            }
        }
    }

    async fn target_ids(&self, target_type: TargetType) -> Result<Vec<String>, DirectoryError> {
        Ok(match target_type {
            TargetType::Credential => self
                .directory
                .all_credentials()
                .await?
                .into_iter()
                .map(|credential| credential.id)
                .collect(),
            TargetType::Proxy => self
                .directory
                .proxies()
                .await?
                .into_iter()
                .map(|proxy| proxy.id)
                .collect(),
            TargetType::Backend => self
                .directory
                .backends()
                .await?
                .into_iter()
                .map(|backend| backend.id)
                .collect(),
        })
    }

    /// First active credential, decoded, when the backend needs one.
    async fn probe_key(&self, backend: &Backend) -> Result<Option<String>, String> {
        if !backend.requires_credential {
            return Ok(None);
        }
        let credentials = self
            .directory
            .active_credentials(&backend.id)
            .await
            .map_err(|err| err.to_string())?;
        let credential = credentials
            .first()
            .ok_or_else(|| "no active credential".to_string())?;
        self.codec
            .decode(&credential.secret)
            .map(Some)
            .map_err(|err| err.to_string())
    }

    async fn probe_backend(&self, backend: &Backend, api_key: Option<String>) -> HealthReport {
        let started = Instant::now();
        let transport = match self.transports.for_backend(backend).await {
            Ok(transport) => transport,
            Err(err) => return HealthReport::unhealthy(started.elapsed(), err.to_string()),
        };
        let client = match self.registry.build(backend, api_key, Some(transport)) {
            Ok(client) => client,
            Err(err) => return HealthReport::unhealthy(started.elapsed(), err.to_string()),
        };
        match tokio::time::timeout(self.config.probe_timeout, client.check_health()).await {
            Ok(report) => report,
            Err(_) => HealthReport::unhealthy(started.elapsed(), "health check timed out"),
        }
    }

    async fn probe_proxy(&self, proxy: &EgressProxy) -> HealthReport {
        let started = Instant::now();
        let transport = match self
            .transports
            .build(Some(proxy), self.config.probe_timeout)
            .await
        {
            Ok(transport) => transport,
            Err(err) => return HealthReport::unhealthy(started.elapsed(), err.to_string()),
        };
        match transport.client().get(&self.config.probe_url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                HealthReport::healthy(started.elapsed())
            }
            Ok(response) => HealthReport::unhealthy(
                started.elapsed(),
                format!("probe returned {}", response.status()),
            ),
            Err(err) => HealthReport::unhealthy(started.elapsed(), err.to_string()),
        }
    }

    async fn finish(
        &self,
        target_type: TargetType,
        target_id: &str,
        report: HealthReport,
        alert_message: impl FnOnce(&str) -> String,
    ) -> HealthSample {
        let sample = HealthSample {
            target_type,
            target_id: target_id.to_string(),
            healthy: report.healthy,
            response_time_ms: duration_ms(report.latency),
            error: report.error,
            checked_at_ms: self.clock.now_millis(),
        };
        if let Err(err) = self.store.append_sample(sample.clone()).await {
            tracing::warn!(%target_type, target_id, error = %err, "failed to store health sample");
        }
        if !sample.healthy {
            let error = sample.error.as_deref().unwrap_or("unknown error");
            tracing::warn!(%target_type, target_id, error, "health check failed");
            if let Err(err) = self
                .alerts
                .notify(target_type, target_id, &alert_message(error))
                .await
            {
                tracing::warn!(%target_type, target_id, error = %err, "failed to raise alert");
            }
        }
        sample
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
