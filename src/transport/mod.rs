//! HTTP clients that originate traffic directly, through one egress proxy, or
//! through a proxy reached by a CONNECT tunnel over its upstream proxy.

mod tunnel;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::directory::{Backend, Directory, DirectoryError, EgressProxy, ProxyKind};
use crate::secret::{SecretError, SharedSecretCodec};
use crate::selector::{RandomSource, SecureRandom, pick_weighted};

pub use tunnel::{ProxyEndpoint, open_tunnel};
use tunnel::TunnelRelay;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CHAIN_WALK: usize = 16;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid proxy address {address:?}: {reason}")]
    InvalidProxyAddress { address: String, reason: String },
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy rejected CONNECT with status {status}: {status_line}")]
    ConnectRejected { status: u16, status_line: String },
    #[error("malformed CONNECT response: {detail}")]
    MalformedConnectResponse { detail: String },
    #[error("proxy chain starting at {proxy_id} loops back on itself")]
    ProxyCycle { proxy_id: String },
    #[error("cannot tunnel to {scheme} proxy: {reason}")]
    UnsupportedTunnelTarget { scheme: String, reason: String },
    #[error("timed out during {stage}")]
    Timeout { stage: &'static str },
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// How an [`EgressTransport`] reaches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRoute {
    Direct,
    Proxied { proxy_id: String },
    Tunneled { proxy_id: String, upstream_id: String },
}

/// An HTTP client plus whatever keeps its route alive.
#[derive(Clone)]
pub struct EgressTransport {
    client: reqwest::Client,
    route: TransportRoute,
    _relay: Option<Arc<TunnelRelay>>,
}

impl EgressTransport {
    pub fn direct(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            route: TransportRoute::Direct,
            _relay: None,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn route(&self) -> &TransportRoute {
        &self.route
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self.route, TransportRoute::Tunneled { .. })
    }

    /// The egress proxy whose statistics this transport's traffic feeds.
    pub fn proxy_id(&self) -> Option<&str> {
        match &self.route {
            TransportRoute::Direct => None,
            TransportRoute::Proxied { proxy_id } | TransportRoute::Tunneled { proxy_id, .. } => {
                Some(proxy_id)
            }
        }
    }
}

impl std::fmt::Debug for EgressTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressTransport")
            .field("route", &self.route)
            .finish()
    }
}

/// Prefixes a scheme inferred from `kind` when `address` has none.
pub fn normalize_proxy_url(address: &str, kind: ProxyKind) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{address}", kind.scheme())
    }
}

/// How the HTTP client speaks to the loopback relay in front of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RelayScheme {
    /// The client talks the target proxy's protocol in clear.
    Plain(String),
    /// The client runs TLS to the target proxy through the relay, so the
    /// relay is addressed by the target's hostname, pinned to loopback.
    Tls { server_name: String },
}

impl RelayScheme {
    fn for_target(target_url: &reqwest::Url) -> Result<Self, TransportError> {
        match target_url.scheme() {
            scheme @ ("http" | "socks5" | "socks5h") => Ok(Self::Plain(scheme.to_string())),
            "https" => {
                let host = target_url.host_str().unwrap_or_default();
                let bare = host.trim_start_matches('[').trim_end_matches(']');
                if bare.parse::<IpAddr>().is_ok() {
                    return Err(TransportError::UnsupportedTunnelTarget {
                        scheme: "https".to_string(),
                        reason: format!("address {host} by hostname for TLS verification"),
                    });
                }
                Ok(Self::Tls {
                    server_name: host.to_string(),
                })
            }
            other => Err(TransportError::UnsupportedTunnelTarget {
                scheme: other.to_string(),
                reason: "unsupported proxy scheme".to_string(),
            }),
        }
    }

    fn relay_url(&self, port: u16) -> String {
        match self {
            Self::Plain(scheme) => format!("{scheme}://127.0.0.1:{port}"),
            Self::Tls { server_name } => format!("https://{server_name}:{port}"),
        }
    }

    /// DNS pin that sends the TLS relay hostname to the loopback listener.
    fn loopback_pin(&self, port: u16) -> Option<(&str, SocketAddr)> {
        match self {
            Self::Plain(_) => None,
            Self::Tls { server_name } => Some((
                server_name.as_str(),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            )),
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "socks5" | "socks5h" => Some(1080),
        _ => None,
    }
}

pub struct TransportBuilder {
    directory: Arc<dyn Directory>,
    codec: SharedSecretCodec,
    connect_timeout: Duration,
    rng: Arc<dyn RandomSource>,
}

impl TransportBuilder {
    pub fn new(directory: Arc<dyn Directory>, codec: SharedSecretCodec) -> Self {
        Self {
            directory,
            codec,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rng: Arc::new(SecureRandom),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    /// Parses the proxy address and attaches its decoded credentials.
    pub fn proxy_url(&self, proxy: &EgressProxy) -> Result<reqwest::Url, TransportError> {
        let normalized = normalize_proxy_url(&proxy.url, proxy.kind);
        let mut url =
            reqwest::Url::parse(&normalized).map_err(|err| TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: err.to_string(),
            })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: "missing host".to_string(),
            });
        }
        if let Some((username, password)) = self.credentials(proxy)? {
            let invalid = |_| TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: "cannot carry credentials".to_string(),
            };
            url.set_username(&username).map_err(invalid)?;
            url.set_password(Some(&password)).map_err(invalid)?;
        }
        Ok(url)
    }

    fn credentials(&self, proxy: &EgressProxy) -> Result<Option<(String, String)>, TransportError> {
        let Some(username) = proxy.username.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let password = match proxy.password.as_deref() {
            Some(stored) => self.codec.decode(stored)?,
            None => String::new(),
        };
        Ok(Some((username.to_string(), password)))
    }

    pub fn endpoint(&self, proxy: &EgressProxy) -> Result<ProxyEndpoint, TransportError> {
        let url = self.proxy_url(proxy)?;
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_default();
        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: format!("no port for scheme {}", url.scheme()),
            })?;
        Ok(ProxyEndpoint {
            host,
            port,
            basic_auth: self.credentials(proxy)?,
        })
    }

    /// Builds a transport through `proxy`, or a direct one when `proxy` is `None`.
    ///
    /// When the proxy names an upstream, the CONNECT handshake to that upstream
    /// happens here, so a refused tunnel surfaces as an error from this call.
    pub async fn build(
        &self,
        proxy: Option<&EgressProxy>,
        timeout: Duration,
    ) -> Result<EgressTransport, TransportError> {
        let Some(proxy) = proxy else {
            return EgressTransport::direct(timeout);
        };

        let upstream = match proxy.upstream_id.as_deref() {
            Some(_) => self.resolve_upstream(proxy).await?,
            None => None,
        };
        match upstream {
            Some(upstream) => self.build_tunneled(proxy, &upstream, timeout).await,
            None => self.build_proxied(proxy, timeout),
        }
    }

    fn build_proxied(
        &self,
        proxy: &EgressProxy,
        timeout: Duration,
    ) -> Result<EgressTransport, TransportError> {
        let url = self.proxy_url(proxy)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(self.connect_timeout)
            .proxy(reqwest::Proxy::all(url.as_str())?)
            .build()?;
        Ok(EgressTransport {
            client,
            route: TransportRoute::Proxied {
                proxy_id: proxy.id.clone(),
            },
            _relay: None,
        })
    }

    async fn build_tunneled(
        &self,
        proxy: &EgressProxy,
        upstream: &EgressProxy,
        timeout: Duration,
    ) -> Result<EgressTransport, TransportError> {
        let target_url = self.proxy_url(proxy)?;
        let scheme = RelayScheme::for_target(&target_url)?;
        let target = self.endpoint(proxy)?;
        let upstream_endpoint = self.endpoint(upstream)?;
        let target_authority = target.authority();

        let first = open_tunnel(&upstream_endpoint, &target_authority, self.connect_timeout).await?;
        let relay =
            TunnelRelay::start(upstream_endpoint, target_authority, first, self.connect_timeout)
                .await?;

        let mut relay_url = reqwest::Url::parse(&scheme.relay_url(relay.port))
            .map_err(|err| TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: err.to_string(),
            })?;
        if let Some((user, pass)) = &target.basic_auth {
            let invalid = |_| TransportError::InvalidProxyAddress {
                address: proxy.url.clone(),
                reason: "cannot carry credentials".to_string(),
            };
            relay_url.set_username(user).map_err(invalid)?;
            relay_url.set_password(Some(pass)).map_err(invalid)?;
        }

        let mut client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(self.connect_timeout)
            .proxy(reqwest::Proxy::all(relay_url.as_str())?);
        if let Some((host, addr)) = scheme.loopback_pin(relay.port) {
            client = client.resolve(host, addr);
        }
        let client = client.build()?;
        tracing::info!(
            proxy_id = %proxy.id,
            upstream_id = %upstream.id,
            tls = matches!(scheme, RelayScheme::Tls { .. }),
            "built tunneled egress transport"
        );
        Ok(EgressTransport {
            client,
            route: TransportRoute::Tunneled {
                proxy_id: proxy.id.clone(),
                upstream_id: upstream.id.clone(),
            },
            _relay: Some(Arc::new(relay)),
        })
    }

    /// Walks the upstream chain once, rejecting loops.
    ///
    /// Only the first upstream hop is used. A missing upstream record falls
    /// back to the single-hop route.
    async fn resolve_upstream(
        &self,
        proxy: &EgressProxy,
    ) -> Result<Option<EgressProxy>, TransportError> {
        let mut visited = HashSet::new();
        visited.insert(proxy.id.clone());

        let mut first_hop: Option<EgressProxy> = None;
        let mut next = proxy.upstream_id.clone();
        for _ in 0..MAX_CHAIN_WALK {
            let Some(next_id) = next.take() else {
                break;
            };
            if !visited.insert(next_id.clone()) {
                return Err(TransportError::ProxyCycle {
                    proxy_id: proxy.id.clone(),
                });
            }
            let hop = match self.directory.proxy(&next_id).await {
                Ok(Some(hop)) => hop,
                Ok(None) | Err(_) if first_hop.is_some() => break,
                Ok(None) => {
                    tracing::warn!(
                        proxy_id = %proxy.id,
                        upstream_id = %next_id,
                        "upstream proxy not found, using direct proxy"
                    );
                    return Ok(None);
                }
                Err(err) => {
                    tracing::warn!(
                        proxy_id = %proxy.id,
                        upstream_id = %next_id,
                        error = %err,
                        "upstream proxy lookup failed, using direct proxy"
                    );
                    return Ok(None);
                }
            };
            next = hop.upstream_id.clone();
            if first_hop.is_none() {
                first_hop = Some(hop);
            } else if next.is_some() {
                tracing::debug!(proxy_id = %proxy.id, "ignoring proxy hops beyond the first upstream");
            }
        }
        Ok(first_hop)
    }

    /// The proxy a backend's traffic should use, following its proxy policy.
    pub async fn proxy_for_backend(
        &self,
        backend: &Backend,
    ) -> Result<Option<EgressProxy>, TransportError> {
        if !backend.use_proxy {
            return Ok(None);
        }
        if let Some(default_id) = backend.default_proxy_id.as_deref() {
            if let Some(proxy) = self.directory.proxy(default_id).await? {
                if proxy.active {
                    return Ok(Some(proxy));
                }
            }
        }
        Ok(self.directory.active_proxies().await?.into_iter().next())
    }

    /// Builds the transport a backend's requests and probes go through.
    pub async fn for_backend(&self, backend: &Backend) -> Result<EgressTransport, TransportError> {
        let proxy = self.proxy_for_backend(backend).await?;
        let timeout = Duration::from_secs(backend.timeout_secs.max(1));
        self.build(proxy.as_ref(), timeout).await
    }

    /// Weighted pick among active proxies.
    pub async fn select_proxy(&self) -> Result<Option<EgressProxy>, TransportError> {
        let proxies = self.directory.active_proxies().await?;
        Ok(pick_weighted(&proxies, |proxy| proxy.weight, self.rng.as_ref()).cloned())
    }
}
