//! Records read by the routing core and the collaborators that own them.
//!
//! The management surface that creates backends, credentials and proxies lives
//! outside this crate; [`Directory`] is the read-mostly view the core needs, and
//! [`UsageSink`] is where finished requests are reported.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {message}")]
    Unavailable { message: String },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    /// Family name used by the client registry (`openai`, `anthropic`, ...).
    pub name: String,
    /// Empty means the family's well-known endpoint.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub requires_credential: bool,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_proxy_id: Option<String>,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: base_url.into(),
            active: true,
            weight: default_weight(),
            priority: 0,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            requires_credential: true,
            use_proxy: false,
            default_proxy_id: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn without_credential(mut self) -> Self {
        self.requires_credential = false;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn with_proxy(mut self, proxy_id: Option<String>) -> Self {
        self.use_proxy = true;
        self.default_proxy_id = proxy_id;
        self
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub backend_id: String,
    /// Stored form; decode through the configured secret codec before use.
    pub secret: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_ms: Option<u64>,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        backend_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let secret = secret.into();
        let prefix = secret.chars().take(8).collect();
        Self {
            id: id.into(),
            backend_id: backend_id.into(),
            secret,
            prefix,
            active: true,
            weight: default_weight(),
            usage_count: 0,
            last_used_ms: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("backend_id", &self.backend_id)
            .field("secret", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("active", &self.active)
            .field("weight", &self.weight)
            .field("usage_count", &self.usage_count)
            .field("last_used_ms", &self.last_used_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyStats {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_ms: Option<u64>,
}

impl ProxyStats {
    /// Folds one observation into the running counters.
    pub fn record(&mut self, success: bool, latency_ms: u64, at_ms: u64) {
        if success {
            self.success_count = self.success_count.saturating_add(1);
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
        }
        let total = self.success_count.saturating_add(self.failure_count);
        if total > 0 {
            let total = total as f64;
            self.avg_latency_ms = (self.avg_latency_ms * (total - 1.0) + latency_ms as f64) / total;
        }
        self.last_checked_ms = Some(at_ms);
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressProxy {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub kind: ProxyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Stored form; decode through the configured secret codec before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub stats: ProxyStats,
}

impl EgressProxy {
    pub fn new(id: impl Into<String>, url: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            kind,
            username: None,
            password: None,
            upstream_id: None,
            active: true,
            weight: default_weight(),
            stats: ProxyStats::default(),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_upstream(mut self, upstream_id: impl Into<String>) -> Self {
        self.upstream_id = Some(upstream_id.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

impl std::fmt::Debug for EgressProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressProxy")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("upstream_id", &self.upstream_id)
            .field("active", &self.active)
            .field("weight", &self.weight)
            .field("stats", &self.stats)
            .finish()
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn backends(&self) -> Result<Vec<Backend>, DirectoryError>;
    async fn backend(&self, id: &str) -> Result<Option<Backend>, DirectoryError>;
    /// Every credential of a backend, active or not.
    async fn credentials(&self, backend_id: &str) -> Result<Vec<Credential>, DirectoryError>;
    async fn all_credentials(&self) -> Result<Vec<Credential>, DirectoryError>;
    async fn proxies(&self) -> Result<Vec<EgressProxy>, DirectoryError>;
    async fn proxy(&self, id: &str) -> Result<Option<EgressProxy>, DirectoryError>;
    async fn touch_credential(&self, id: &str, at_ms: u64) -> Result<(), DirectoryError>;
    async fn record_proxy_result(
        &self,
        id: &str,
        success: bool,
        latency_ms: u64,
        at_ms: u64,
    ) -> Result<(), DirectoryError>;

    async fn active_backends(&self) -> Result<Vec<Backend>, DirectoryError> {
        Ok(self
            .backends()
            .await?
            .into_iter()
            .filter(|backend| backend.active)
            .collect())
    }

    async fn active_credentials(&self, backend_id: &str) -> Result<Vec<Credential>, DirectoryError> {
        Ok(self
            .credentials(backend_id)
            .await?
            .into_iter()
            .filter(|credential| credential.active)
            .collect())
    }

    async fn active_proxies(&self) -> Result<Vec<EgressProxy>, DirectoryError> {
        Ok(self
            .proxies()
            .await?
            .into_iter()
            .filter(|proxy| proxy.active)
            .collect())
    }
}

#[derive(Debug, Default)]
struct DirectoryInner {
    backends: Vec<Backend>,
    credentials: Vec<Credential>,
    proxies: Vec<EgressProxy>,
}

/// Process-local directory seeded from configuration.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl MemoryDirectory {
    pub fn new(
        backends: Vec<Backend>,
        credentials: Vec<Credential>,
        proxies: Vec<EgressProxy>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DirectoryInner {
                backends,
                credentials,
                proxies,
            })),
        }
    }

    pub async fn upsert_backend(&self, backend: Backend) {
        let mut inner = self.inner.write().await;
        match inner.backends.iter_mut().find(|b| b.id == backend.id) {
            Some(existing) => *existing = backend,
            None => inner.backends.push(backend),
        }
    }

    pub async fn upsert_credential(&self, credential: Credential) {
        let mut inner = self.inner.write().await;
        match inner.credentials.iter_mut().find(|c| c.id == credential.id) {
            Some(existing) => *existing = credential,
            None => inner.credentials.push(credential),
        }
    }

    pub async fn upsert_proxy(&self, proxy: EgressProxy) {
        let mut inner = self.inner.write().await;
        match inner.proxies.iter_mut().find(|p| p.id == proxy.id) {
            Some(existing) => *existing = proxy,
            None => inner.proxies.push(proxy),
        }
    }

    pub async fn credential(&self, id: &str) -> Option<Credential> {
        let inner = self.inner.read().await;
        inner.credentials.iter().find(|c| c.id == id).cloned()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn backends(&self) -> Result<Vec<Backend>, DirectoryError> {
        Ok(self.inner.read().await.backends.clone())
    }

    async fn backend(&self, id: &str) -> Result<Option<Backend>, DirectoryError> {
        let inner = self.inner.read().await;
        Ok(inner.backends.iter().find(|b| b.id == id).cloned())
    }

    async fn credentials(&self, backend_id: &str) -> Result<Vec<Credential>, DirectoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .credentials
            .iter()
            .filter(|c| c.backend_id == backend_id)
            .cloned()
            .collect())
    }

    async fn all_credentials(&self) -> Result<Vec<Credential>, DirectoryError> {
        Ok(self.inner.read().await.credentials.clone())
    }

    async fn proxies(&self) -> Result<Vec<EgressProxy>, DirectoryError> {
        Ok(self.inner.read().await.proxies.clone())
    }

    async fn proxy(&self, id: &str) -> Result<Option<EgressProxy>, DirectoryError> {
        let inner = self.inner.read().await;
        Ok(inner.proxies.iter().find(|p| p.id == id).cloned())
    }

    async fn touch_credential(&self, id: &str, at_ms: u64) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().await;
        let credential = inner
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "credential",
                id: id.to_string(),
            })?;
        credential.usage_count = credential.usage_count.saturating_add(1);
        credential.last_used_ms = Some(at_ms);
        Ok(())
    }

    async fn record_proxy_result(
        &self,
        id: &str,
        success: bool,
        latency_ms: u64,
        at_ms: u64,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().await;
        let proxy = inner
            .proxies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "proxy",
                id: id.to_string(),
            })?;
        proxy.stats.record(success, latency_ms, at_ms);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub credential_id: Option<String>,
    pub backend_id: String,
    pub model: String,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), DirectoryError>;
}

/// Keeps every record in memory; handy for tests and `check` runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryUsageSink {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<(), DirectoryError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Emits each record as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<(), DirectoryError> {
        tracing::info!(
            user_id = %record.user_id,
            credential_id = record.credential_id.as_deref().unwrap_or("-"),
            backend_id = %record.backend_id,
            model = %record.model,
            request_tokens = record.request_tokens,
            response_tokens = record.response_tokens,
            total_tokens = record.total_tokens,
            latency_ms = record.latency_ms,
            status_code = record.status_code,
            error = record.error_message.as_deref().unwrap_or(""),
            "usage"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_stats_keep_running_average() {
        let mut stats = ProxyStats::default();
        stats.record(true, 100, 1);
        stats.record(false, 300, 2);
        stats.record(true, 200, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_checked_ms, Some(3));
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let credential = Credential::new("k1", "b1", "sk-very-secret");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn memory_directory_touch_updates_usage() {
        let directory = MemoryDirectory::new(
            vec![Backend::new("b1", "openai", "http://localhost")],
            vec![Credential::new("k1", "b1", "sk-1")],
            Vec::new(),
        );
        directory.touch_credential("k1", 42).await.expect("touch");
        let credential = directory.credential("k1").await.expect("credential");
        assert_eq!(credential.usage_count, 1);
        assert_eq!(credential.last_used_ms, Some(42));

        let err = directory
            .touch_credential("missing", 1)
            .await
            .expect_err("missing credential");
        assert!(matches!(err, DirectoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn active_filters_skip_inactive_records() {
        let directory = MemoryDirectory::new(
            vec![
                Backend::new("b1", "openai", "http://a"),
                Backend::new("b2", "openai", "http://b").inactive(),
            ],
            vec![
                Credential::new("k1", "b1", "sk-1"),
                Credential::new("k2", "b1", "sk-2").inactive(),
            ],
            vec![EgressProxy::new("p1", "proxy:8080", ProxyKind::Http).inactive()],
        );
        let backends = directory.active_backends().await.expect("backends");
        assert_eq!(backends.len(), 1);
        let credentials = directory.active_credentials("b1").await.expect("credentials");
        assert_eq!(credentials.len(), 1);
        assert!(directory.active_proxies().await.expect("proxies").is_empty());
    }
}
