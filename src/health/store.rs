use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Alert, AlertConfig, AlertStatus, HealthSample, StoreError, TargetType};

/// Fields of an alert before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub target_type: TargetType,
    pub target_id: String,
    pub alert_type: String,
    pub message: String,
    pub created_at_ms: u64,
}

#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn append_sample(&self, sample: HealthSample) -> Result<(), StoreError>;

    /// Most recent samples first.
    async fn recent_samples(
        &self,
        target_type: TargetType,
        target_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthSample>, StoreError>;

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError>;

    async fn alert(&self, id: u64) -> Result<Option<Alert>, StoreError>;

    async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Newest first, with the total number of matching alerts.
    async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Alert>, u64), StoreError>;

    async fn alert_config(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<AlertConfig>, StoreError>;

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<(), StoreError>;
}

const MAX_SAMPLES_PER_TARGET: usize = 1_000;
pub const DEFAULT_ALERT_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryInner {
    samples: HashMap<(TargetType, String), VecDeque<HealthSample>>,
    alerts: Vec<Alert>,
    next_alert_id: u64,
    configs: HashMap<(TargetType, String), AlertConfig>,
}

/// Keeps samples in bounded per-target rings and alerts in insertion order.
///
/// Alerts are bounded too: past capacity the oldest resolved alert goes
/// first, then the oldest alert of any status.
#[derive(Debug, Clone)]
pub struct MemoryHealthStore {
    inner: Arc<Mutex<MemoryInner>>,
    alert_capacity: usize,
}

impl Default for MemoryHealthStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            alert_capacity: DEFAULT_ALERT_CAPACITY,
        }
    }
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alert_capacity(mut self, capacity: usize) -> Self {
        self.alert_capacity = capacity.max(1);
        self
    }
}

fn prune_alerts(alerts: &mut Vec<Alert>, capacity: usize) {
    while alerts.len() > capacity {
        let evict = alerts
            .iter()
            .position(|alert| alert.status == AlertStatus::Resolved)
            .unwrap_or(0);
        alerts.remove(evict);
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn append_sample(&self, sample: HealthSample) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let ring = inner
            .samples
            .entry((sample.target_type, sample.target_id.clone()))
            .or_default();
        ring.push_front(sample);
        ring.truncate(MAX_SAMPLES_PER_TARGET);
        Ok(())
    }

    async fn recent_samples(
        &self,
        target_type: TargetType,
        target_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthSample>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .samples
            .get(&(target_type, target_id.to_string()))
            .map(|ring| ring.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_alert_id += 1;
        let alert = Alert {
            id: inner.next_alert_id,
            target_type: alert.target_type,
            target_id: alert.target_id,
            alert_type: alert.alert_type,
            message: alert.message,
            status: AlertStatus::Active,
            created_at_ms: alert.created_at_ms,
            acknowledged_at_ms: None,
            resolved_at_ms: None,
        };
        inner.alerts.push(alert.clone());
        prune_alerts(&mut inner.alerts, self.alert_capacity);
        Ok(alert)
    }

    async fn alert(&self, id: u64) -> Result<Option<Alert>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.alerts.iter().find(|alert| alert.id == id).cloned())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .alerts
            .iter_mut()
            .find(|existing| existing.id == alert.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "alert",
                id: alert.id.to_string(),
            })?;
        *existing = alert.clone();
        Ok(())
    }

    async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Alert>, u64), StoreError> {
        let inner = self.inner.lock().await;
        let matching: Vec<&Alert> = inner
            .alerts
            .iter()
            .rev()
            .filter(|alert| status.is_none_or(|status| alert.status == status))
            .collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn alert_config(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<AlertConfig>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .configs
            .get(&(target_type, target_id.to_string()))
            .cloned())
    }

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .configs
            .insert((config.target_type, config.target_id.clone()), config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, healthy: bool, at: u64) -> HealthSample {
        HealthSample {
            target_type: TargetType::Credential,
            target_id: id.to_string(),
            healthy,
            response_time_ms: 5,
            error: None,
            checked_at_ms: at,
        }
    }

    #[tokio::test]
    async fn recent_samples_are_newest_first_and_limited() {
        let store = MemoryHealthStore::new();
        for at in 1..=12 {
            store.append_sample(sample("k1", at % 2 == 0, at)).await.expect("append");
        }
        store.append_sample(sample("k2", true, 99)).await.expect("append");

        let recent = store
            .recent_samples(TargetType::Credential, "k1", 10)
            .await
            .expect("recent");
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].checked_at_ms, 12);
        assert_eq!(recent[9].checked_at_ms, 3);
    }

    #[tokio::test]
    async fn list_alerts_filters_and_pages_newest_first() {
        let store = MemoryHealthStore::new();
        for n in 0..5u64 {
            store
                .insert_alert(NewAlert {
                    target_type: TargetType::Proxy,
                    target_id: format!("p{n}"),
                    alert_type: "health_check_failed".to_string(),
                    message: "Proxy health check failed".to_string(),
                    created_at_ms: n,
                })
                .await
                .expect("insert");
        }
        let mut second = store.alert(2).await.expect("get").expect("exists");
        second.resolve(10);
        store.update_alert(&second).await.expect("update");

        let (page, total) = store.list_alerts(None, 0, 2).await.expect("list");
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|a| a.id).collect::<Vec<_>>(), vec![5, 4]);

        let (page, total) = store
            .list_alerts(Some(AlertStatus::Active), 2, 10)
            .await
            .expect("list");
        assert_eq!(total, 4);
        assert_eq!(page.iter().map(|a| a.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    fn new_alert(n: u64) -> NewAlert {
        NewAlert {
            target_type: TargetType::Backend,
            target_id: "b1".to_string(),
            alert_type: "health_check_failed".to_string(),
            message: "Provider health check failed: down".to_string(),
            created_at_ms: n,
        }
    }

    #[tokio::test]
    async fn alerts_are_bounded_and_resolved_ones_go_first() {
        let store = MemoryHealthStore::new().with_alert_capacity(3);
        for n in 0..3 {
            store.insert_alert(new_alert(n)).await.expect("insert");
        }
        let mut second = store.alert(2).await.expect("get").expect("exists");
        second.resolve(5);
        store.update_alert(&second).await.expect("update");

        store.insert_alert(new_alert(3)).await.expect("insert");
        let (alerts, total) = store.list_alerts(None, 0, 10).await.expect("list");
        assert_eq!(total, 3);
        assert_eq!(alerts.iter().map(|a| a.id).collect::<Vec<_>>(), vec![4, 3, 1]);

        store.insert_alert(new_alert(4)).await.expect("insert");
        let (alerts, total) = store.list_alerts(None, 0, 10).await.expect("list");
        assert_eq!(total, 3);
        assert_eq!(alerts.iter().map(|a| a.id).collect::<Vec<_>>(), vec![5, 4, 3]);
        assert!(store.alert(1).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn a_target_that_stays_down_does_not_grow_alerts_without_bound() {
        let store = MemoryHealthStore::new().with_alert_capacity(50);
        for n in 0..500 {
            store.insert_alert(new_alert(n)).await.expect("insert");
        }
        let (alerts, total) = store.list_alerts(None, 0, 100).await.expect("list");
        assert_eq!(total, 50);
        assert_eq!(alerts[0].id, 500);
        assert_eq!(alerts[49].id, 451);
    }

    #[tokio::test]
    async fn alert_config_upsert_replaces() {
        let store = MemoryHealthStore::new();
        store
            .upsert_alert_config(AlertConfig::new(TargetType::Backend, "b1"))
            .await
            .expect("insert");
        store
            .upsert_alert_config(
                AlertConfig::new(TargetType::Backend, "b1").with_webhook("http://hook"),
            )
            .await
            .expect("update");
        let config = store
            .alert_config(TargetType::Backend, "b1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(config.webhook_url.as_deref(), Some("http://hook"));
    }
}
