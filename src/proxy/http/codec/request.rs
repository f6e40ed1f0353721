use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::HeaderAccumulator;
use super::line::{LineTimeout, read_line};

pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub header_bytes: usize,
}

/// Reads the next request head from a client connection.
///
/// Returns `Ok(None)` when the connection closes or stays idle past `idle_timeout` before a
/// request starts. Once the first byte arrives the whole head must be read within
/// `header_timeout`.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let limit = LineTimeout::Deadline(Instant::now() + header_timeout);
    let mut line = String::new();
    let request_line_bytes = read_line(reader, &mut line, limit, peer, max_header_bytes).await?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    ensure!(
        line.ends_with('\n'),
        "request line from {peer} missing newline terminator"
    );
    let (method, target, version) = parse_request_line(line.trim_end_matches(['\r', '\n']))?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let mut accumulator = HeaderAccumulator::new(remaining);
    loop {
        let read = read_line(reader, &mut line, limit, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        if !accumulator
            .push_line(&line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }
    let header_bytes = request_line_bytes + accumulator.total_bytes();
    let block = accumulator
        .finish()
        .with_context(|| format!("invalid request framing from {peer}"))?;
    if block.transfer_encoding_present {
        let value = block
            .headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        ensure!(
            value.trim().eq_ignore_ascii_case("chunked")
                && block
                    .headers
                    .get_all(http::header::TRANSFER_ENCODING)
                    .iter()
                    .count()
                    == 1,
            "unsupported request Transfer-Encoding '{value}'"
        );
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers: block.headers,
        content_length: block.content_length,
        chunked: block.chunked,
        header_bytes,
    }))
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    ensure!(!line.is_empty(), "empty request line");
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    Ok((method, target.to_string(), version))
}
