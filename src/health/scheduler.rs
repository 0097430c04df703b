use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::HealthChecker;
use crate::utils::task::AbortOnDrop;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Runs [`HealthChecker::run_cycle`] on a fixed interval, independent of
/// request traffic.
pub struct HealthScheduler {
    checker: Arc<HealthChecker>,
    interval: Duration,
}

/// Keeps the scheduler task alive; dropping it stops the task.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    _task: AbortOnDrop,
}

impl SchedulerHandle {
    /// Lets an in-flight cycle finish its current probe, then exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl HealthScheduler {
    pub fn new(checker: Arc<HealthChecker>) -> Self {
        Self {
            checker,
            interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(10));
        self
    }

    /// The first cycle runs immediately.
    pub fn start(self, cancel: CancellationToken) -> SchedulerHandle {
        let token = cancel.clone();
        let interval = self.interval;
        let checker = self.checker;
        let task = AbortOnDrop::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "health scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = checker.run_cycle() => {
                        if let Err(err) = result {
                            tracing::warn!(error = %err, "health check cycle failed");
                        }
                    }
                }
            }
            tracing::info!("health scheduler stopped");
        });
        SchedulerHandle {
            cancel,
            _task: task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::directory::{Backend, Directory, MemoryDirectory};
    use crate::health::{AlertManager, MemoryHealthStore, TargetType};
    use crate::secret::plain_codec;
    use crate::transport::TransportBuilder;

    #[tokio::test]
    async fn scheduler_runs_cycles_until_stopped() {
        let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new(
            vec![Backend::new("b1", "openai", "http://127.0.0.1:9/v1")],
            Vec::new(),
            Vec::new(),
        ));
        let store = Arc::new(MemoryHealthStore::new());
        let checker = Arc::new(HealthChecker::new(
            directory.clone(),
            Arc::new(BackendRegistry::with_defaults()),
            Arc::new(TransportBuilder::new(directory, plain_codec())),
            plain_codec(),
            store.clone(),
            Arc::new(AlertManager::new(store.clone())),
        ));

        let handle = HealthScheduler::new(checker.clone())
            .with_interval(Duration::from_millis(20))
            .start(CancellationToken::new());

        let mut seen = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            seen = checker
                .target_status(TargetType::Backend, "b1")
                .await
                .expect("status")
                .sample_count;
            if seen >= 2 {
                break;
            }
        }
        assert!(seen >= 2, "expected repeated cycles, saw {seen}");

        handle.stop();
        assert!(handle.is_stopped());
    }
}
