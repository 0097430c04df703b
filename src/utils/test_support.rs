//! Helpers shared by integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn should_skip_httpmock() -> bool {
    if can_bind_localhost() {
        return false;
    }
    eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
    true
}

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// Request heads seen by a fake proxy, in arrival order.
pub type CapturedHeads = Arc<Mutex<Vec<String>>>;

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
        if head.ends_with(b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&head).to_string());
        }
    }
}

/// A forward proxy that answers every CONNECT with `status_line` and, on 2xx,
/// splices the connection to `forward_to`.
pub async fn start_connect_proxy(
    status_line: &'static str,
    forward_to: Option<SocketAddr>,
) -> std::io::Result<(SocketAddr, CapturedHeads)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let captured: CapturedHeads = Arc::default();
    let seen = captured.clone();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let Some(head) = read_head(&mut inbound).await else {
                    return;
                };
                if let Ok(mut heads) = seen.lock() {
                    heads.push(head);
                }
                let response = format!("{status_line}\r\nContent-Length: 0\r\n\r\n");
                if inbound.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let accepted = status_line.split_whitespace().nth(1).is_some_and(|code| code.starts_with('2'));
                if !accepted {
                    return;
                }
                if let Some(target) = forward_to {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                }
            });
        }
    });
    Ok((addr, captured))
}

/// A plain HTTP forward proxy that answers every request itself with `body`.
pub async fn start_answering_proxy(
    body: &'static str,
) -> std::io::Result<(SocketAddr, CapturedHeads)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let captured: CapturedHeads = Arc::default();
    let seen = captured.clone();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let Some(head) = read_head(&mut inbound).await else {
                    return;
                };
                if let Ok(mut heads) = seen.lock() {
                    heads.push(head);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = inbound.write_all(response.as_bytes()).await;
                let _ = inbound.shutdown().await;
            });
        }
    });
    Ok((addr, captured))
}

/// Raw bytes received per connection, in arrival order.
pub type CapturedBytes = Arc<Mutex<Vec<Vec<u8>>>>;

/// Accepts connections, keeps the first TLS record each one sends and hangs up.
pub async fn start_tls_record_sink() -> std::io::Result<(SocketAddr, CapturedBytes)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let captured: CapturedBytes = Arc::default();
    let seen = captured.clone();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut record = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match inbound.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => record.extend_from_slice(&chunk[..n]),
                    }
                    if record.len() >= 5 {
                        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
                        if record.len() >= 5 + len {
                            break;
                        }
                    }
                }
                if let Ok(mut records) = seen.lock() {
                    records.push(record);
                }
            });
        }
    });
    Ok((addr, captured))
}

pub fn records(captured: &CapturedBytes) -> Vec<Vec<u8>> {
    captured.lock().map(|records| records.clone()).unwrap_or_default()
}

pub fn heads(captured: &CapturedHeads) -> Vec<String> {
    captured.lock().map(|heads| heads.clone()).unwrap_or_default()
}
