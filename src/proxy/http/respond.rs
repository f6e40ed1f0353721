use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Writes a small `text/plain` response generated by the proxy itself. With `head_only` the
/// body is announced via `Content-Length` but not sent.
pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    head_only: bool,
    close: bool,
    timeout_dur: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason_text = status.canonical_reason().unwrap_or("Unknown");
    let connection = if close { "Connection: close\r\n" } else { "" };
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n{connection}\r\n",
        status.as_u16(),
        reason_text,
        body.len()
    );
    timeout_with_context(
        timeout_dur,
        stream.write_all(header.as_bytes()),
        "writing response header",
    )
    .await?;
    if !body.is_empty() && !head_only {
        timeout_with_context(timeout_dur, stream.write_all(body), "writing response body").await?;
    }
    timeout_with_context(timeout_dur, stream.flush(), "flushing response").await
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_text_response() -> Result<()> {
        let mut out = Vec::new();
        send_response(
            &mut out,
            StatusCode::BAD_GATEWAY,
            b"Bad Gateway\n",
            false,
            true,
            Duration::from_secs(1),
        )
        .await?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nBad Gateway\n"));
        Ok(())
    }

    #[tokio::test]
    async fn head_only_omits_body() -> Result<()> {
        let mut out = Vec::new();
        send_response(
            &mut out,
            StatusCode::OK,
            b"ok",
            true,
            false,
            Duration::from_secs(1),
        )
        .await?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("Connection"));
        assert!(text.ends_with("\r\n\r\n"));
        Ok(())
    }
}
