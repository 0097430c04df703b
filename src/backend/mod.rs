//! Uniform chat/list/health contract over upstream backend families.

mod anthropic;
mod openai_compatible;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::directory::Backend;
use crate::transport::EgressTransport;
use crate::types::{ChatRequest, ChatResponse, ModelInfo, StreamChunk};

pub use anthropic::AnthropicClient;
pub use openai_compatible::{AuthStyle, OpenAiCompatibleClient};

pub type ChatStream = BoxStream<'static, Result<StreamChunk>>;

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Registry name of the family this client speaks.
    fn family(&self) -> &str;

    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    async fn check_health(&self) -> HealthReport;
}

/// Everything a constructor needs to build one client.
pub struct ClientSpec<'a> {
    pub backend: &'a Backend,
    pub api_key: Option<String>,
    pub transport: EgressTransport,
}

pub type ClientConstructor =
    Arc<dyn for<'a> Fn(ClientSpec<'a>) -> Arc<dyn BackendClient> + Send + Sync>;

fn generic_client(spec: ClientSpec<'_>) -> Arc<dyn BackendClient> {
    Arc::new(OpenAiCompatibleClient::from_spec(spec, AuthStyle::Bearer))
}

/// Maps backend family names to client constructors.
///
/// Unknown names are served by the generic OpenAI-compatible client.
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: HashMap<String, ClientConstructor>,
    fallback: ClientConstructor,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
            fallback: Arc::new(generic_client),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("openai", generic_client);
        registry.register("google", generic_client);
        registry.register("lmstudio", |spec| -> Arc<dyn BackendClient> {
            Arc::new(OpenAiCompatibleClient::from_spec(spec, AuthStyle::None))
        });
        registry.register("ollama", |spec| -> Arc<dyn BackendClient> {
            Arc::new(OpenAiCompatibleClient::ollama(spec))
        });
        registry.register("anthropic", |spec| -> Arc<dyn BackendClient> {
            Arc::new(AnthropicClient::from_spec(spec))
        });
        registry
    }

    pub fn register<F>(&mut self, family: impl Into<String>, constructor: F)
    where
        F: for<'a> Fn(ClientSpec<'a>) -> Arc<dyn BackendClient> + Send + Sync + 'static,
    {
        self.constructors
            .insert(family.into().to_ascii_lowercase(), Arc::new(constructor));
    }

    pub fn is_registered(&self, family: &str) -> bool {
        self.constructors.contains_key(&family.to_ascii_lowercase())
    }

    /// Builds a client for `backend`, going direct when no transport is given.
    pub fn build(
        &self,
        backend: &Backend,
        api_key: Option<String>,
        transport: Option<EgressTransport>,
    ) -> Result<Arc<dyn BackendClient>> {
        let transport = match transport {
            Some(transport) => transport,
            None => EgressTransport::direct(Duration::from_secs(backend.timeout_secs.max(1)))?,
        };
        let constructor = self
            .constructors
            .get(&backend.name.to_ascii_lowercase())
            .unwrap_or(&self.fallback);
        Ok(constructor(ClientSpec {
            backend,
            api_key,
            transport,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_family_falls_back_to_openai_compatible() {
        let registry = BackendRegistry::with_defaults();
        let backend = Backend::new("b1", "vllm-cluster", "http://127.0.0.1:9/v1");
        let client = registry.build(&backend, None, None).expect("client");
        assert_eq!(client.family(), "vllm-cluster");
        assert!(!registry.is_registered("vllm-cluster"));
    }

    #[test]
    fn registry_lookup_ignores_case() {
        let registry = BackendRegistry::with_defaults();
        let backend = Backend::new("b1", "Anthropic", "http://127.0.0.1:9");
        let client = registry.build(&backend, Some("k".into()), None).expect("client");
        assert_eq!(client.family(), "anthropic");
    }

    #[test]
    fn registering_a_family_overrides_the_fallback() {
        struct Fixed;

        #[async_trait]
        impl BackendClient for Fixed {
            fn family(&self) -> &str {
                "fixed"
            }
            async fn send_chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
                Err(crate::RelayError::InvalidResponse("unused".into()))
            }
            async fn stream_chat(&self, _request: &ChatRequest) -> Result<ChatStream> {
                Err(crate::RelayError::InvalidResponse("unused".into()))
            }
            async fn list_models(&self) -> Result<Vec<ModelInfo>> {
                Ok(vec![ModelInfo::named("fixed-1")])
            }
            async fn check_health(&self) -> HealthReport {
                HealthReport::healthy(Duration::ZERO)
            }
        }

        let mut registry = BackendRegistry::with_defaults();
        registry.register("custom", |_spec| -> Arc<dyn BackendClient> { Arc::new(Fixed) });
        let backend = Backend::new("b1", "custom", "http://unused");
        let client = registry.build(&backend, None, None).expect("client");
        assert_eq!(client.family(), "fixed");
    }
}
