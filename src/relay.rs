//! Assembles the routing core and health subsystem from a [`RelayConfig`].

use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::config::{ConfigError, HealthConfig, RelayConfig};
use crate::directory::{Directory, MemoryDirectory, UsageSink};
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::health::{
    AlertConfig, AlertManager, HealthChecker, HealthScheduler, HealthStore, MemoryHealthStore,
    StoreError,
};
use crate::pool::CredentialPool;
use crate::routing::ModelRouter;
use crate::transport::TransportBuilder;

/// Opens the configured health store; SQLite when a path is set and the
/// `store-sqlite` feature is built in, memory otherwise.
pub async fn open_health_store(config: &HealthConfig) -> Result<Arc<dyn HealthStore>, StoreError> {
    match &config.sqlite_path {
        #[cfg(feature = "store-sqlite")]
        Some(path) => {
            let store = crate::health::SqliteHealthStore::new(path.clone());
            store.init().await?;
            tracing::info!(path = %path.display(), "health store opened");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-sqlite"))]
        Some(path) => {
            tracing::warn!(
                path = %path.display(),
                "sqlite_path set but store-sqlite is not built in; keeping health data in memory"
            );
            Ok(Arc::new(MemoryHealthStore::new()))
        }
        None => Ok(Arc::new(MemoryHealthStore::new())),
    }
}

pub struct Relay {
    directory: MemoryDirectory,
    dispatcher: Arc<Dispatcher>,
    checker: Arc<HealthChecker>,
    alert_configs: Vec<AlertConfig>,
    health: HealthConfig,
}

impl Relay {
    pub fn from_config(
        config: &RelayConfig,
        store: Arc<dyn HealthStore>,
        usage: Arc<dyn UsageSink>,
    ) -> Result<Self, ConfigError> {
        let directory = MemoryDirectory::new(
            config.backends.clone(),
            config.credentials.clone(),
            config.proxies.clone(),
        );
        let shared: Arc<dyn Directory> = Arc::new(directory.clone());
        let codec = config.codec()?;
        let registry = Arc::new(BackendRegistry::with_defaults());
        let transports = Arc::new(TransportBuilder::new(shared.clone(), codec.clone()));

        let pool = Arc::new(
            CredentialPool::new(shared.clone()).with_window(config.routing.failure_window()),
        );
        let router = ModelRouter::new(&config.routing.patterns(), config.routing.strategy)?;
        let dispatcher = Dispatcher::new(
            pool,
            transports.clone(),
            registry.clone(),
            router,
            usage,
            codec.clone(),
        )
        .with_config(DispatchConfig {
            max_attempts: config.routing.max_attempts,
            request_timeout: config.routing.request_timeout(),
            model_cache_ttl: config.models.cache_ttl(),
            listing_timeout: config.models.listing_timeout(),
        });

        let alerts = Arc::new(AlertManager::new(store.clone()));
        let checker = HealthChecker::new(shared, registry, transports, codec, store, alerts)
            .with_config(config.health.checker_config());

        Ok(Self {
            directory,
            dispatcher: Arc::new(dispatcher),
            checker: Arc::new(checker),
            alert_configs: config.alert_configs.clone(),
            health: config.health.clone(),
        })
    }

    /// Writes the configured alert settings into the health store.
    pub async fn seed_alert_configs(&self) -> Result<(), StoreError> {
        for config in &self.alert_configs {
            self.checker
                .alerts()
                .upsert_alert_config(config.clone())
                .await?;
        }
        Ok(())
    }

    pub fn directory(&self) -> &MemoryDirectory {
        &self.directory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    /// `None` when periodic checks are switched off.
    pub fn scheduler(&self) -> Option<HealthScheduler> {
        self.health.enabled.then(|| {
            HealthScheduler::new(self.checker.clone()).with_interval(self.health.interval())
        })
    }

    #[cfg(feature = "server")]
    pub fn http_state(&self) -> crate::http::RelayHttpState {
        crate::http::RelayHttpState::new(self.dispatcher.clone(), self.checker.clone())
    }
}
