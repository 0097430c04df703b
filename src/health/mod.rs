//! Periodic liveness probes, rolling health statistics and alerting.

mod alert;
mod checker;
mod scheduler;
#[cfg(feature = "store-sqlite")]
mod sqlite_store;
mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use alert::{AlertManager, AlertPage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, WebhookPayload};
pub use checker::{
    CycleSummary, DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_URL, HealthChecker, HealthCheckerConfig,
};
pub use scheduler::{DEFAULT_CHECK_INTERVAL, HealthScheduler, SchedulerHandle};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteHealthStore;
pub use store::{HealthStore, MemoryHealthStore, NewAlert};

pub const DEFAULT_SAMPLE_WINDOW: usize = 10;
pub const ALERT_TYPE_HEALTH_CHECK_FAILED: &str = "health_check_failed";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[serde(rename = "api_key")]
    Credential,
    Proxy,
    #[serde(rename = "provider")]
    Backend,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "api_key",
            Self::Proxy => "proxy",
            Self::Backend => "provider",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "api_key" | "credential" => Some(Self::Credential),
            "proxy" => Some(Self::Proxy),
            "provider" | "backend" => Some(Self::Backend),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub target_type: TargetType,
    pub target_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at_ms: u64,
}

/// Rolling view over the most recent samples of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub target_type: TargetType,
    pub target_id: String,
    pub healthy: bool,
    pub last_check_ms: Option<u64>,
    pub response_time_ms: Option<u64>,
    pub success_rate: f64,
    pub sample_count: usize,
}

impl HealthStatus {
    /// `samples` must be newest first.
    pub fn from_samples(target_type: TargetType, target_id: &str, samples: &[HealthSample]) -> Self {
        let latest = samples.first();
        let healthy_count = samples.iter().filter(|sample| sample.healthy).count();
        let success_rate = if samples.is_empty() {
            0.0
        } else {
            healthy_count as f64 / samples.len() as f64
        };
        Self {
            target_type,
            target_id: target_id.to_string(),
            healthy: latest.is_none_or(|sample| sample.healthy),
            last_check_ms: latest.map(|sample| sample.checked_at_ms),
            response_time_ms: latest.map(|sample| sample.response_time_ms),
            success_rate,
            sample_count: samples.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "acknowledged" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub target_type: TargetType,
    pub target_id: String,
    pub alert_type: String,
    pub message: String,
    pub status: AlertStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
}

impl Alert {
    /// Moves an active alert to acknowledged. Returns whether anything changed.
    pub fn acknowledge(&mut self, at_ms: u64) -> bool {
        if self.status != AlertStatus::Active {
            return false;
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at_ms = Some(at_ms);
        true
    }

    /// Resolves an active or acknowledged alert. Resolved is terminal.
    pub fn resolve(&mut self, at_ms: u64) -> bool {
        if self.status == AlertStatus::Resolved {
            return false;
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at_ms = Some(at_ms);
        true
    }
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub target_type: TargetType,
    pub target_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Not yet used for gating; every failed probe notifies.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_email: Option<String>,
}

impl AlertConfig {
    pub fn new(target_type: TargetType, target_id: impl Into<String>) -> Self {
        Self {
            target_type,
            target_id: target_id.into(),
            enabled: true,
            failure_threshold: default_failure_threshold(),
            webhook_url: None,
            notify_email: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
