use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    ALERT_TYPE_HEALTH_CHECK_FAILED, Alert, AlertConfig, AlertStatus, HealthStore, NewAlert,
    StoreError, TargetType,
};
use crate::clock::{Clock, SystemClock, rfc3339};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Body posted to an alert webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub target_type: TargetType,
    pub target_id: String,
    pub alert_type: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPage {
    pub alerts: Vec<Alert>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

/// Creates alerts for failed probes, delivers webhooks and moves alerts
/// through their lifecycle.
pub struct AlertManager {
    store: Arc<dyn HealthStore>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    pub fn new(store: Arc<dyn HealthStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "webhook client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self {
            store,
            http,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records a failed probe as an alert unless alerting is switched off for
    /// the target. Targets without a config alert but have no webhook.
    pub async fn notify(
        &self,
        target_type: TargetType,
        target_id: &str,
        message: &str,
    ) -> Result<Option<Alert>, StoreError> {
        let config = self.store.alert_config(target_type, target_id).await?;
        if config.as_ref().is_some_and(|config| !config.enabled) {
            tracing::debug!(%target_type, target_id, "alerting disabled for target");
            return Ok(None);
        }

        let alert = self
            .store
            .insert_alert(NewAlert {
                target_type,
                target_id: target_id.to_string(),
                alert_type: ALERT_TYPE_HEALTH_CHECK_FAILED.to_string(),
                message: message.to_string(),
                created_at_ms: self.clock.now_millis(),
            })
            .await?;
        tracing::warn!(
            alert_id = alert.id,
            %target_type,
            target_id,
            message,
            "health alert raised"
        );

        if let Some(url) = config
            .as_ref()
            .and_then(|config| config.webhook_url.as_deref())
            .filter(|url| !url.trim().is_empty())
        {
            self.deliver_webhook(url, &alert).await;
        }
        Ok(Some(alert))
    }

    /// Delivery failures are logged and never surface to the caller.
    async fn deliver_webhook(&self, url: &str, alert: &Alert) {
        let payload = WebhookPayload {
            target_type: alert.target_type,
            target_id: alert.target_id.clone(),
            alert_type: alert.alert_type.clone(),
            message: alert.message.clone(),
            timestamp: rfc3339(alert.created_at_ms),
        };
        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().as_u16() >= 400 => {
                tracing::error!(
                    alert_id = alert.id,
                    status = response.status().as_u16(),
                    "alert webhook rejected"
                );
            }
            Ok(_) => {
                tracing::debug!(alert_id = alert.id, "alert webhook delivered");
            }
            Err(err) => {
                tracing::warn!(alert_id = alert.id, error = %err, "alert webhook failed");
            }
        }
    }

    pub async fn acknowledge(&self, alert_id: u64) -> Result<Alert, StoreError> {
        let mut alert = self.existing(alert_id).await?;
        if alert.acknowledge(self.clock.now_millis()) {
            self.store.update_alert(&alert).await?;
        }
        Ok(alert)
    }

    pub async fn resolve(&self, alert_id: u64) -> Result<Alert, StoreError> {
        let mut alert = self.existing(alert_id).await?;
        if alert.resolve(self.clock.now_millis()) {
            self.store.update_alert(&alert).await?;
        }
        Ok(alert)
    }

    async fn existing(&self, alert_id: u64) -> Result<Alert, StoreError> {
        self.store
            .alert(alert_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "alert",
                id: alert_id.to_string(),
            })
    }

    /// Pages are 1-based; page size is clamped to `1..=100`.
    pub async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        page: usize,
        page_size: usize,
    ) -> Result<AlertPage, StoreError> {
        let page = page.max(1);
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        let offset = (page - 1).saturating_mul(page_size);
        let (alerts, total) = self.store.list_alerts(status, offset, page_size).await?;
        Ok(AlertPage {
            alerts,
            total,
            page,
            page_size,
        })
    }

    pub async fn upsert_alert_config(&self, config: AlertConfig) -> Result<(), StoreError> {
        self.store.upsert_alert_config(config).await
    }

    pub async fn alert_config(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<AlertConfig>, StoreError> {
        self.store.alert_config(target_type, target_id).await
    }
}
