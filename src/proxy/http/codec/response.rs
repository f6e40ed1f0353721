use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::http::body::BodyPlan;

use super::headers::HeaderAccumulator;
use super::line::{LineTimeout, read_line};

pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

/// Serializes a status line and header block. Framing headers are derived from `plan`; any
/// `Connection`, `Transfer-Encoding` or `Content-Length` in `headers` is ignored, except that an
/// empty-bodied response keeps the origin's `Content-Length` (HEAD).
pub(crate) fn encode_response_head(
    status: StatusCode,
    reason: Option<&str>,
    headers: &HeaderMap,
    plan: BodyPlan,
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    let reason = reason
        .filter(|reason| !reason.is_empty())
        .or_else(|| status.canonical_reason())
        .unwrap_or("");
    buffer.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", status.as_u16()).as_bytes());

    for (name, value) in headers {
        if name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        if name == CONTENT_LENGTH && !matches!(plan, BodyPlan::Empty) {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        BodyPlan::Chunked => buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        BodyPlan::Empty | BodyPlan::UntilClose => {}
    }
    if close || matches!(plan, BodyPlan::UntilClose) {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Reads one response head from the origin. The whole head must arrive within `timeout`.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let limit = LineTimeout::Deadline(Instant::now() + timeout);
    let mut line = String::new();
    let status_bytes = read_line(reader, &mut line, limit, peer, max_header_bytes).await?;
    if status_bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    let (version, status, reason) = parse_status_line(line.trim_end_matches(['\r', '\n']))?;

    let remaining = max_header_bytes
        .checked_sub(status_bytes)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
    let mut accumulator = HeaderAccumulator::new(remaining);
    loop {
        let read = read_line(reader, &mut line, limit, peer, remaining).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        if !accumulator
            .push_line(&line)
            .context("invalid upstream response header")?
        {
            break;
        }
    }
    let block = accumulator.finish().inspect_err(|_| {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
    })?;

    let mut connection_close = version == Version::HTTP_10;
    for token in block
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
    {
        if token.eq_ignore_ascii_case("close") {
            connection_close = true;
        } else if token.eq_ignore_ascii_case("keep-alive") && version == Version::HTTP_10 {
            connection_close = false;
        }
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers: block.headers,
        content_length: block.content_length,
        chunked: block.chunked,
        connection_close,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}
