//! File configuration: listener, logging, routing, health and the static
//! directory seed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::{Backend, Credential, EgressProxy};
use crate::health::{AlertConfig, DEFAULT_PROBE_URL, DEFAULT_SAMPLE_WINDOW, HealthCheckerConfig};
use crate::routing::{ModelPattern, RoutingStrategy, default_model_patterns};
use crate::secret::{AesGcmSecretCodec, Base64SecretCodec, PlainSecretCodec, SharedSecretCodec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse yaml config failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format for {path} (expected .toml, .yaml, .yml or .json)")]
    UnsupportedFormat { path: PathBuf },
    #[error("invalid model pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Well-known endpoint for a backend family, used when `base_url` is empty.
pub fn default_base_url(family: &str) -> Option<&'static str> {
    match family.to_ascii_lowercase().as_str() {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com"),
        "google" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "ollama" => Some("http://host.docker.internal:11434"),
        "lmstudio" => Some("http://host.docker.internal:1234/v1"),
        _ => None,
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub secret_codec: SecretCodecKind,
    /// Key for the `aes_gcm` codec; falls back to `LLM_RELAY_ENCRYPTION_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<EncryptionKey>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub proxies: Vec<EgressProxy>,
    #[serde(default)]
    pub alert_configs: Vec<AlertConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            logging: LoggingConfig::default(),
            routing: RoutingConfig::default(),
            models: ModelsConfig::default(),
            health: HealthConfig::default(),
            secret_codec: SecretCodecKind::default(),
            encryption_key: None,
            backends: Vec::new(),
            credentials: Vec::new(),
            proxies: Vec::new(),
            alert_configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Plain,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_failure_window_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Replaces the built-in family table when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_patterns: Option<Vec<ModelPattern>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            max_attempts: default_max_attempts(),
            failure_window_secs: default_failure_window_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            model_patterns: None,
        }
    }
}

impl RoutingConfig {
    pub fn patterns(&self) -> Vec<ModelPattern> {
        self.model_patterns
            .clone()
            .unwrap_or_else(default_model_patterns)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_listing_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_listing_timeout_secs")]
    pub listing_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            listing_timeout_secs: default_listing_timeout_secs(),
        }
    }
}

impl ModelsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.listing_timeout_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_sample_window() -> usize {
    DEFAULT_SAMPLE_WINDOW
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
    /// Persist samples and alerts here instead of in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_url: default_probe_url(),
            sample_window: default_sample_window(),
            sqlite_path: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn checker_config(&self) -> HealthCheckerConfig {
        HealthCheckerConfig {
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
            probe_url: self.probe_url.clone(),
            sample_window: self.sample_window.max(1),
        }
    }
}

pub const ENCRYPTION_KEY_ENV: &str = "LLM_RELAY_ENCRYPTION_KEY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretCodecKind {
    #[default]
    Plain,
    Base64,
    AesGcm,
}

impl SecretCodecKind {
    /// `aes_gcm` without a key stores secrets as plaintext.
    pub fn codec(self, key: Option<&EncryptionKey>) -> Result<SharedSecretCodec, ConfigError> {
        match self {
            Self::Plain => Ok(Arc::new(PlainSecretCodec)),
            Self::Base64 => Ok(Arc::new(Base64SecretCodec)),
            Self::AesGcm => match key.filter(|key| !key.0.is_empty()) {
                Some(key) => {
                    let codec = AesGcmSecretCodec::new(key.0.as_bytes())
                        .map_err(|err| ConfigError::Invalid(format!("encryption_key: {err}")))?;
                    Ok(Arc::new(codec))
                }
                None => {
                    tracing::warn!("aes_gcm codec has no encryption key, secrets are read as plaintext");
                    Ok(Arc::new(PlainSecretCodec))
                }
            },
        }
    }
}

/// Raw AES-256 key material. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl RelayConfig {
    /// Reads a config file, picking the parser from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase);
        let mut config: Self = match extension.as_deref() {
            Some("toml") => toml::from_str(&raw)?,
            Some("yaml" | "yml") => serde_yaml::from_str(&raw)?,
            Some("json") => serde_json::from_str(&raw)?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                });
            }
        };
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// The secret codec every component decodes stored secrets with.
    pub fn codec(&self) -> Result<SharedSecretCodec, ConfigError> {
        self.secret_codec.codec(self.encryption_key.as_ref())
    }

    /// Fills empty backend base URLs from the family table.
    pub fn apply_defaults(&mut self) {
        if self.encryption_key.is_none() {
            self.encryption_key = std::env::var(ENCRYPTION_KEY_ENV)
                .ok()
                .filter(|key| !key.is_empty())
                .map(EncryptionKey);
        }
        for backend in &mut self.backends {
            if backend.base_url.trim().is_empty() {
                if let Some(url) = default_base_url(&backend.name) {
                    backend.base_url = url.to_string();
                }
            }
        }
        let Ok(codec) = self.codec() else {
            return;
        };
        for credential in &mut self.credentials {
            if credential.prefix.is_empty() {
                if let Ok(plaintext) = codec.decode(&credential.secret) {
                    credential.prefix = plaintext.chars().take(8).collect();
                }
            }
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|err| ConfigError::Invalid(format!("listen address {:?}: {err}", self.listen)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.codec()?;
        if self.routing.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "routing.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id {}",
                    backend.id
                )));
            }
            if backend.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend {} has no base_url and {} has no default",
                    backend.id, backend.name
                )));
            }
        }

        let mut credential_ids = HashSet::new();
        for credential in &self.credentials {
            if !credential_ids.insert(credential.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate credential id {}",
                    credential.id
                )));
            }
            if !backend_ids.contains(credential.backend_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "credential {} references unknown backend {}",
                    credential.id, credential.backend_id
                )));
            }
        }

        let proxy_ids: HashSet<&str> = self.proxies.iter().map(|proxy| proxy.id.as_str()).collect();
        if proxy_ids.len() != self.proxies.len() {
            return Err(ConfigError::Invalid("duplicate proxy id".to_string()));
        }
        for proxy in &self.proxies {
            if let Some(upstream) = proxy.upstream_id.as_deref() {
                if !proxy_ids.contains(upstream) {
                    tracing::warn!(
                        proxy_id = %proxy.id,
                        upstream_id = upstream,
                        "proxy references unknown upstream; it will be used single-hop"
                    );
                }
            }
        }

        if let Some(patterns) = &self.routing.model_patterns {
            for pattern in patterns {
                regex::Regex::new(&pattern.pattern).map_err(|source| {
                    ConfigError::InvalidPattern {
                        pattern: pattern.pattern.clone(),
                        source,
                    }
                })?;
            }
        }
        Ok(())
    }
}
