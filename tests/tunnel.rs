use std::sync::Arc;
use std::time::Duration;

use llm_relay::directory::{EgressProxy, ProxyKind};
use llm_relay::secret::plain_codec;
use llm_relay::transport::{ProxyEndpoint, TransportRoute, open_tunnel};
use llm_relay::utils::test_support::{
    heads, records, should_skip_httpmock, start_answering_proxy, start_connect_proxy,
    start_tls_record_sink,
};
use llm_relay::{MemoryDirectory, TransportBuilder, TransportError};

fn builder(proxies: Vec<EgressProxy>) -> TransportBuilder {
    let directory = MemoryDirectory::new(Vec::new(), Vec::new(), proxies);
    TransportBuilder::new(Arc::new(directory), plain_codec())
        .with_connect_timeout(Duration::from_secs(3))
}

#[tokio::test]
async fn two_hop_tunnel_carries_requests_to_the_target_proxy() {
    if should_skip_httpmock() {
        return;
    }
    let (target_addr, target_heads) = start_answering_proxy(r#"{"hop":"target"}"#).await.unwrap();
    let (upstream_addr, upstream_heads) =
        start_connect_proxy("HTTP/1.1 200 Connection established", Some(target_addr))
            .await
            .unwrap();

    let target = EgressProxy::new("target", target_addr.to_string(), ProxyKind::Http)
        .with_upstream("upstream");
    let upstream = EgressProxy::new("upstream", upstream_addr.to_string(), ProxyKind::Http)
        .with_auth("alice", "s3cret");
    let builder = builder(vec![target.clone(), upstream]);

    let transport = builder
        .build(Some(&target), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(transport.is_tunneled());
    assert_eq!(
        transport.route(),
        &TransportRoute::Tunneled {
            proxy_id: "target".to_string(),
            upstream_id: "upstream".to_string(),
        }
    );
    assert_eq!(transport.proxy_id(), Some("target"));

    let body = transport
        .client()
        .get("http://models.backend.invalid/v1/models")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, r#"{"hop":"target"}"#);

    let connects = heads(&upstream_heads);
    assert!(!connects.is_empty());
    let expected = format!("CONNECT {target_addr} HTTP/1.1\r\n");
    assert!(connects[0].starts_with(&expected), "{}", connects[0]);
    assert!(connects[0].contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));

    let requests = heads(&target_heads);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET http://models.backend.invalid/v1/models HTTP/1.1"));
}

#[tokio::test]
async fn https_target_proxy_gets_a_tls_handshake_for_its_hostname() {
    if should_skip_httpmock() {
        return;
    }
    let (sink_addr, hellos) = start_tls_record_sink().await.unwrap();
    let (upstream_addr, upstream_heads) =
        start_connect_proxy("HTTP/1.1 200 Connection established", Some(sink_addr))
            .await
            .unwrap();

    let target = EgressProxy::new("secure", "secure-proxy.example:443", ProxyKind::Https)
        .with_upstream("upstream");
    let upstream = EgressProxy::new("upstream", upstream_addr.to_string(), ProxyKind::Http);
    let builder = builder(vec![target.clone(), upstream]);

    let transport = builder
        .build(Some(&target), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(transport.is_tunneled());

    let connects = heads(&upstream_heads);
    assert!(
        connects[0].starts_with("CONNECT secure-proxy.example:443 HTTP/1.1\r\n"),
        "{}",
        connects[0]
    );

    // The sink hangs up after the ClientHello, so the request itself fails.
    let result = transport
        .client()
        .get("http://models.backend.invalid/v1/models")
        .send()
        .await;
    assert!(result.is_err());

    let hellos = records(&hellos);
    assert_eq!(hellos.len(), 1);
    let hello = &hellos[0];
    assert_eq!(hello[0], 0x16, "expected a TLS handshake record");
    assert!(
        hello
            .windows(b"secure-proxy.example".len())
            .any(|window| window == b"secure-proxy.example"),
        "ClientHello should name the target proxy"
    );
}

#[tokio::test]
async fn https_target_addressed_by_ip_is_rejected_before_dialing() {
    let target = EgressProxy::new("secure", "10.9.8.7:443", ProxyKind::Https)
        .with_upstream("upstream");
    let upstream = EgressProxy::new("upstream", "127.0.0.1:9", ProxyKind::Http);
    let builder = builder(vec![target.clone(), upstream]);

    let err = builder
        .build(Some(&target), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::UnsupportedTunnelTarget { .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn rejected_connect_is_reported_with_status() {
    if should_skip_httpmock() {
        return;
    }
    let (upstream_addr, _) =
        start_connect_proxy("HTTP/1.1 407 Proxy Authentication Required", None)
            .await
            .unwrap();
    let target = EgressProxy::new("target", "127.0.0.1:3128", ProxyKind::Http)
        .with_upstream("upstream");
    let upstream = EgressProxy::new("upstream", upstream_addr.to_string(), ProxyKind::Http);
    let builder = builder(vec![target.clone(), upstream]);

    let err = builder
        .build(Some(&target), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::ConnectRejected { status: 407, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn bad_gateway_from_upstream_is_rejected() {
    if should_skip_httpmock() {
        return;
    }
    let (upstream_addr, _) = start_connect_proxy("HTTP/1.1 502 Bad Gateway", None)
        .await
        .unwrap();
    let endpoint = ProxyEndpoint {
        host: "127.0.0.1".to_string(),
        port: upstream_addr.port(),
        basic_auth: None,
    };
    let err = open_tunnel(&endpoint, "10.1.2.3:8080", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectRejected { status: 502, .. }));
}

#[tokio::test]
async fn unreachable_upstream_is_a_dial_error() {
    if should_skip_httpmock() {
        return;
    }
    let closed = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let endpoint = ProxyEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        basic_auth: None,
    };
    let err = open_tunnel(&endpoint, "10.1.2.3:8080", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Dial { .. }), "{err:?}");
}

#[tokio::test]
async fn single_hop_proxy_sees_absolute_form_requests() {
    if should_skip_httpmock() {
        return;
    }
    let (proxy_addr, captured) = start_answering_proxy("pong").await.unwrap();
    let proxy = EgressProxy::new("solo", proxy_addr.to_string(), ProxyKind::Http)
        .with_auth("bob", "pw");
    let builder = builder(vec![proxy.clone()]);

    let transport = builder
        .build(Some(&proxy), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!transport.is_tunneled());

    let body = transport
        .client()
        .get("http://probe.backend.invalid/")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "pong");

    let seen = heads(&captured);
    assert!(seen[0].starts_with("GET http://probe.backend.invalid/ HTTP/1.1"));
    assert!(
        seen[0]
            .to_ascii_lowercase()
            .contains("proxy-authorization: basic ym9ionb3")
    );
}
