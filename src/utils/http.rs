use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{RelayError, Result};

pub(crate) const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Reads at most `max_bytes` of a body, marking anything cut off.
pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() > remaining {
            out.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        out.extend_from_slice(&chunk);
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Sends the request and turns any non-2xx status into [`RelayError::Api`].
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(RelayError::Api { status, body });
    }
    Ok(response)
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| {
        RelayError::InvalidResponse(format!(
            "{err}: {}",
            String::from_utf8_lossy(&bytes[..bytes.len().min(512)])
        ))
    })
}

/// Joins a base URL and a path without doubling or dropping slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
