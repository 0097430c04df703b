use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::TransportError;
use crate::utils::task::AbortOnDrop;

const MAX_CONNECT_RESPONSE_BYTES: usize = 16 * 1024;
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next accept after `consecutive` failed accepts in a row.
fn accept_backoff(consecutive: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1u32 << consecutive.saturating_sub(1).min(10))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Where to dial and how to authenticate against one proxy hop.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub basic_auth: Option<(String, String)>,
}

impl ProxyEndpoint {
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "basic_auth",
                &self.basic_auth.as_ref().map(|(user, _)| (user, "<redacted>")),
            )
            .finish()
    }
}

/// Opens a raw connection to `upstream` and issues `CONNECT target_authority`.
///
/// The returned stream is positioned right after the CONNECT response head,
/// ready to carry traffic addressed to the target hop.
pub async fn open_tunnel(
    upstream: &ProxyEndpoint,
    target_authority: &str,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let address = upstream.authority();
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address.as_str()))
        .await
        .map_err(|_| TransportError::Timeout {
            stage: "upstream dial",
        })?
        .map_err(|source| TransportError::Dial {
            address: address.clone(),
            source,
        })?;

    let request = connect_request(target_authority, upstream.basic_auth.as_ref());
    tokio::time::timeout(timeout, async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout {
        stage: "connect write",
    })?
    .map_err(|source| TransportError::Dial {
        address: address.clone(),
        source,
    })?;

    let head = tokio::time::timeout(timeout, read_response_head(&mut stream))
        .await
        .map_err(|_| TransportError::Timeout {
            stage: "connect response",
        })??;
    let status = parse_status_line(&head)?;
    if !(200..300).contains(&status) {
        return Err(TransportError::ConnectRejected {
            status,
            status_line: head.lines().next().unwrap_or_default().to_string(),
        });
    }

    tracing::debug!(upstream = %address, target = target_authority, "connect tunnel established");
    Ok(stream)
}

pub(crate) fn connect_request(
    target_authority: &str,
    basic_auth: Option<&(String, String)>,
) -> String {
    let mut request = format!("CONNECT {target_authority} HTTP/1.1\r\nHost: {target_authority}\r\n");
    if let Some((user, pass)) = basic_auth {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Reads byte-by-byte so nothing past the blank line is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut head = Vec::<u8>::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|err| TransportError::MalformedConnectResponse {
                detail: err.to_string(),
            })?;
        if n == 0 {
            return Err(TransportError::MalformedConnectResponse {
                detail: "connection closed before response head".to_string(),
            });
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_CONNECT_RESPONSE_BYTES {
            return Err(TransportError::MalformedConnectResponse {
                detail: format!("response head exceeds {MAX_CONNECT_RESPONSE_BYTES} bytes"),
            });
        }
    }
    Ok(String::from_utf8_lossy(&head).to_string())
}

fn parse_status_line(head: &str) -> Result<u16, TransportError> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::MalformedConnectResponse {
            detail: format!("unexpected status line: {line}"),
        });
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TransportError::MalformedConnectResponse {
            detail: format!("missing status code: {line}"),
        })
}

/// Loopback listener that splices each accepted connection into a fresh tunnel.
///
/// The HTTP client points its proxy at this listener; bytes then flow
/// `client -> relay -> upstream hop -> target hop` unchanged.
pub(crate) struct TunnelRelay {
    pub(crate) port: u16,
    pub(crate) _task: AbortOnDrop,
}

impl TunnelRelay {
    pub(crate) async fn start(
        upstream: ProxyEndpoint,
        target_authority: String,
        first: TcpStream,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|source| TransportError::Dial {
                address: "127.0.0.1:0".to_string(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| TransportError::Dial {
                address: "127.0.0.1:0".to_string(),
                source,
            })?
            .port();

        let first = Arc::new(Mutex::new(Some(first)));
        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (mut inbound, _) = match listener.accept().await {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let pause = accept_backoff(failures);
                        tracing::warn!(
                            error = %err,
                            backoff_ms = pause.as_millis() as u64,
                            "tunnel relay accept failed"
                        );
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                };
                let upstream = upstream.clone();
                let target_authority = target_authority.clone();
                let first = first.clone();
                tokio::spawn(async move {
                    let preopened = first.lock().await.take();
                    let tunnel = match preopened {
                        Some(stream) => Ok(stream),
                        None => open_tunnel(&upstream, &target_authority, timeout).await,
                    };
                    let mut tunnel = match tunnel {
                        Ok(stream) => stream,
                        Err(err) => {
                            tracing::warn!(
                                upstream = %upstream.authority(),
                                target = %target_authority,
                                error = %err,
                                "tunnel relay could not reach target hop"
                            );
                            return;
                        }
                    };
                    if let Err(err) = tokio::io::copy_bidirectional(&mut inbound, &mut tunnel).await {
                        tracing::debug!(error = %err, "tunnel relay connection closed");
                    }
                });
            }
        });

        Ok(Self {
            port,
            _task: AbortOnDrop::new(task.abort_handle()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_failures_back_off_up_to_a_ceiling() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
        assert!(accept_backoff(0) > Duration::ZERO);
    }

    #[test]
    fn connect_request_carries_basic_auth() {
        let auth = ("user".to_string(), "pass".to_string());
        let request = connect_request("proxy-b.internal:3128", Some(&auth));
        assert_eq!(
            request,
            "CONNECT proxy-b.internal:3128 HTTP/1.1\r\nHost: proxy-b.internal:3128\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_without_auth_has_no_header() {
        let request = connect_request("10.0.0.2:8080", None);
        assert!(!request.contains("Proxy-Authorization"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parses_status_codes() {
        assert_eq!(
            parse_status_line("HTTP/1.1 200 Connection established\r\n\r\n").expect("status"),
            200
        );
        assert_eq!(parse_status_line("HTTP/1.0 407 Proxy Auth\r\n\r\n").expect("status"), 407);
        assert!(parse_status_line("SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_status_line("HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn endpoint_authority_brackets_ipv6() {
        let endpoint = ProxyEndpoint {
            host: "::1".to_string(),
            port: 8080,
            basic_auth: None,
        };
        assert_eq!(endpoint.authority(), "[::1]:8080");
    }
}
