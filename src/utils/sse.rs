//! Server-sent events in both directions: parsing upstream `data:` frames and
//! framing chunks for the calling client.

use bytes::Bytes;
use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{RelayError, Result};

pub const DONE_EVENT: &str = "data: [DONE]\n\n";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Frames one JSON value as `data: <json>\n\n`.
pub fn encode_event<T: Serialize>(value: &T) -> Result<Bytes> {
    let json = serde_json::to_string(value)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

pub fn done_event() -> Bytes {
    Bytes::from_static(DONE_EVENT.as_bytes())
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take_len) > max_bytes {
            return Err(RelayError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);
        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

async fn read_next_data<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();
    loop {
        if !read_line_limited(reader, line_bytes, limits.max_line_bytes.max(1)).await? {
            if buffer.is_empty() || buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let line = std::str::from_utf8(line_bytes)
            .map_err(|err| RelayError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.trim_start();
        let separator = usize::from(!buffer.is_empty());
        if buffer.len() + separator + rest.len() > limits.max_event_bytes {
            return Err(RelayError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                limits.max_event_bytes
            )));
        }
        if separator == 1 {
            buffer.push('\n');
        }
        buffer.push_str(rest);
    }
}

/// Yields each event's `data` payload; stops at `[DONE]` or end of input.
pub fn sse_data_stream<R>(reader: R, limits: SseLimits) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new()),
        move |(mut reader, mut line_bytes, mut buffer)| async move {
            match read_next_data(&mut reader, &mut line_bytes, &mut buffer, limits).await? {
                Some(data) => Ok(Some((data, (reader, line_bytes, buffer)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_stream(tokio::io::BufReader::new(reader), SseLimits::default())
}
