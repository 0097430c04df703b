//! Per-credential temporary failure tracking.
//!
//! A credential is either `Available` or `Failed` until its mark expires. The
//! pool never retries on its own; callers drive the attempt loop with
//! [`CredentialPool::select_credential`] and
//! [`CredentialPool::select_next_credential`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::directory::{Credential, Directory, DirectoryError};
use crate::selector::{RandomSource, SecureRandom, pick_weighted};

pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

const QUOTA_KEYWORDS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "429",
    "insufficient_quota",
    "billing",
    "exceeded",
    "limit reached",
    "resource exhausted",
    "resourceexhausted",
];

/// True when an upstream error text reads like a quota or rate-limit rejection.
pub fn is_quota_or_rate_limit(error_text: &str) -> bool {
    let lower = error_text.to_ascii_lowercase();
    QUOTA_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no active credentials for backend {backend_id}")]
    NoCredentials { backend_id: String },
    #[error("no alternative credentials available for backend {backend_id}")]
    NoAlternative { backend_id: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMark {
    pub failed_at_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    Available,
    Failed { until_ms: u64, reason: String },
}

impl CredentialState {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

pub struct CredentialPool {
    directory: Arc<dyn Directory>,
    marks: RwLock<HashMap<String, FailureMark>>,
    window: Duration,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
}

impl CredentialPool {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            marks: RwLock::new(HashMap::new()),
            window: DEFAULT_FAILURE_WINDOW,
            clock: Arc::new(SystemClock),
            rng: Arc::new(SecureRandom),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    fn state_of(&self, marks: &HashMap<String, FailureMark>, id: &str, now_ms: u64) -> CredentialState {
        match marks.get(id) {
            Some(mark) => {
                let until_ms = mark.failed_at_ms.saturating_add(self.window_ms());
                if now_ms < until_ms {
                    CredentialState::Failed {
                        until_ms,
                        reason: mark.reason.clone(),
                    }
                } else {
                    CredentialState::Available
                }
            }
            None => CredentialState::Available,
        }
    }

    pub async fn state(&self, credential_id: &str) -> CredentialState {
        let marks = self.marks.read().await;
        self.state_of(&marks, credential_id, self.clock.now_millis())
    }

    pub async fn is_failed(&self, credential_id: &str) -> bool {
        !self.state(credential_id).await.is_available()
    }

    /// Weighted pick among the backend's usable credentials.
    ///
    /// When every active credential is marked failed, all of their marks are
    /// cleared and the whole set becomes selectable again.
    pub async fn select_credential(&self, backend_id: &str) -> Result<Credential, PoolError> {
        let credentials = self.directory.active_credentials(backend_id).await?;
        if credentials.is_empty() {
            return Err(PoolError::NoCredentials {
                backend_id: backend_id.to_string(),
            });
        }

        let mut available = self.filter_available(&credentials, None).await;
        if available.is_empty() {
            self.reset_backend(backend_id, &credentials).await;
            available = credentials;
        }

        self.pick(available, backend_id)
    }

    /// Like [`Self::select_credential`] but skips `exclude_id` and never resets.
    pub async fn select_next_credential(
        &self,
        backend_id: &str,
        exclude_id: &str,
    ) -> Result<Credential, PoolError> {
        let credentials = self.directory.active_credentials(backend_id).await?;
        let available = self.filter_available(&credentials, Some(exclude_id)).await;
        if available.is_empty() {
            return Err(PoolError::NoAlternative {
                backend_id: backend_id.to_string(),
            });
        }
        self.pick(available, backend_id)
    }

    pub async fn mark_failed(&self, credential_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(credential_id, reason = %reason, "credential marked temporarily failed");
        let mark = FailureMark {
            failed_at_ms: self.clock.now_millis(),
            reason,
        };
        self.marks
            .write()
            .await
            .insert(credential_id.to_string(), mark);
    }

    pub async fn clear_failure(&self, credential_id: &str) {
        if self.marks.write().await.remove(credential_id).is_some() {
            tracing::debug!(credential_id, "credential failure cleared");
        }
    }

    /// Drops marks whose window has passed.
    pub async fn prune_expired(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let window_ms = self.window_ms();
        let mut marks = self.marks.write().await;
        let before = marks.len();
        marks.retain(|_, mark| now_ms < mark.failed_at_ms.saturating_add(window_ms));
        before - marks.len()
    }

    async fn filter_available(
        &self,
        credentials: &[Credential],
        exclude_id: Option<&str>,
    ) -> Vec<Credential> {
        let now_ms = self.clock.now_millis();
        let marks = self.marks.read().await;
        credentials
            .iter()
            .filter(|credential| Some(credential.id.as_str()) != exclude_id)
            .filter(|credential| self.state_of(&marks, &credential.id, now_ms).is_available())
            .cloned()
            .collect()
    }

    async fn reset_backend(&self, backend_id: &str, credentials: &[Credential]) {
        let mut marks = self.marks.write().await;
        for credential in credentials {
            marks.remove(&credential.id);
        }
        tracing::warn!(
            backend_id,
            total = credentials.len(),
            "all credentials temporarily failed, resetting pool"
        );
    }

    fn pick(&self, candidates: Vec<Credential>, backend_id: &str) -> Result<Credential, PoolError> {
        pick_weighted(&candidates, |credential| credential.weight, self.rng.as_ref())
            .cloned()
            .ok_or_else(|| PoolError::NoCredentials {
                backend_id: backend_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::{Backend, MemoryDirectory};
    use crate::selector::tests::FixedRandom;

    fn pool_with(credentials: Vec<Credential>, clock: Arc<ManualClock>) -> CredentialPool {
        let directory = MemoryDirectory::new(
            vec![Backend::new("b1", "openai", "http://localhost")],
            credentials,
            Vec::new(),
        );
        CredentialPool::new(Arc::new(directory))
            .with_clock(clock)
            .with_random(Arc::new(FixedRandom(0.0)))
    }

    fn three_keys() -> Vec<Credential> {
        vec![
            Credential::new("k1", "b1", "sk-1"),
            Credential::new("k2", "b1", "sk-2"),
            Credential::new("k3", "b1", "sk-3"),
        ]
    }

    #[test]
    fn classifies_quota_and_rate_limit_text() {
        assert!(is_quota_or_rate_limit("Rate limit reached for gpt-4"));
        assert!(is_quota_or_rate_limit("HTTP 429 Too Many Requests"));
        assert!(is_quota_or_rate_limit("{\"code\":\"insufficient_quota\"}"));
        assert!(is_quota_or_rate_limit("RESOURCE EXHAUSTED"));
        assert!(is_quota_or_rate_limit("billing hard limit"));
        assert!(!is_quota_or_rate_limit("invalid api key"));
        assert!(!is_quota_or_rate_limit("connection refused"));
    }

    #[tokio::test]
    async fn empty_pool_is_an_error() {
        let pool = pool_with(vec![Credential::new("k1", "b1", "sk-1").inactive()], Arc::new(ManualClock::new(0)));
        let err = pool.select_credential("b1").await.expect_err("no credentials");
        assert!(matches!(err, PoolError::NoCredentials { .. }));
    }

    #[tokio::test]
    async fn failed_credential_is_skipped_within_window() {
        let clock = Arc::new(ManualClock::new(1_000));
        let pool = pool_with(three_keys(), clock.clone());
        pool.mark_failed("k1", "rate limit").await;

        clock.advance_millis(DEFAULT_FAILURE_WINDOW.as_millis() as u64 - 1);
        for _ in 0..10 {
            let picked = pool.select_credential("b1").await.expect("select");
            assert_ne!(picked.id, "k1");
        }
        assert!(pool.is_failed("k1").await);
    }

    #[tokio::test]
    async fn mark_expires_after_window() {
        let clock = Arc::new(ManualClock::new(1_000));
        let pool = pool_with(three_keys(), clock.clone());
        pool.mark_failed("k1", "quota").await;

        clock.advance_millis(DEFAULT_FAILURE_WINDOW.as_millis() as u64 + 1);
        assert_eq!(pool.state("k1").await, CredentialState::Available);
        let picked = pool.select_credential("b1").await.expect("select");
        assert_eq!(picked.id, "k1");
        assert_eq!(pool.prune_expired().await, 1);
    }

    #[tokio::test]
    async fn all_failed_resets_marks_for_backend() {
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool_with(three_keys(), clock);
        for id in ["k1", "k2", "k3"] {
            pool.mark_failed(id, "429").await;
        }

        let picked = pool.select_credential("b1").await.expect("reset selection");
        assert_eq!(picked.id, "k1");
        for id in ["k1", "k2", "k3"] {
            assert!(!pool.is_failed(id).await, "{id} should be cleared");
        }
    }

    #[tokio::test]
    async fn next_credential_excludes_current_and_failed() {
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool_with(three_keys(), clock);
        pool.mark_failed("k2", "quota").await;

        let next = pool.select_next_credential("b1", "k1").await.expect("next");
        assert_eq!(next.id, "k3");

        pool.mark_failed("k3", "quota").await;
        let err = pool
            .select_next_credential("b1", "k1")
            .await
            .expect_err("nothing left");
        assert!(matches!(err, PoolError::NoAlternative { .. }));
    }

    #[tokio::test]
    async fn clear_failure_restores_availability() {
        let clock = Arc::new(ManualClock::new(0));
        let pool = pool_with(three_keys(), clock);
        pool.mark_failed("k1", "quota").await;
        assert!(matches!(pool.state("k1").await, CredentialState::Failed { .. }));
        pool.clear_failure("k1").await;
        assert_eq!(pool.state("k1").await, CredentialState::Available);
    }
}
