pub mod backend;
pub mod clock;
pub mod config;
pub mod directory;
pub mod dispatch;
mod error;
pub mod health;
#[cfg(feature = "server")]
pub mod http;
pub mod pool;
pub mod relay;
pub mod routing;
pub mod secret;
pub mod selector;
pub mod transport;
pub mod types;
pub mod utils;

pub use error::{RelayError, Result};

pub use backend::{BackendClient, BackendRegistry, HealthReport};
pub use config::{ConfigError, RelayConfig};
pub use directory::{
    Backend, Credential, Directory, DirectoryError, EgressProxy, MemoryDirectory,
    MemoryUsageSink, ProxyKind, UsageRecord, UsageSink,
};
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher};
pub use pool::{CredentialPool, PoolError};
pub use relay::Relay;
pub use routing::{ModelPattern, ModelRouter, RoutingStrategy};
pub use transport::{EgressTransport, TransportBuilder, TransportError};
pub use types::{ChatMessage, ChatRequest, ChatResponse, ModelInfo, StreamChunk, Usage};
