use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use http::header::EXPECT;
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::io_util::CountingWriter;
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::forward::ClientRequest;
use crate::proxy::headers::wants_close;
use crate::util::timeout_with_context;

use super::body::{BodyPlan, BodyTooLarge, read_body, request_body_plan};
use super::codec::{RequestHead, read_request_head};
use super::respond::{send_response, shutdown_stream};

const HEALTH_PATH: &str = "/healthz";
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Serves keep-alive HTTP/1.x requests on one client connection until the client leaves, a
/// response requires closing, or shutdown is signalled between requests.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = app.settings.clone();
    let client_timeout = settings.client_timeout();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = CountingWriter::new(write_half);

    loop {
        if *shutdown.borrow() {
            break;
        }
        let head = tokio::select! {
            head = read_request_head(
                &mut reader,
                peer,
                client_timeout,
                client_timeout,
                settings.max_request_header_size,
            ) => head,
            _ = shutdown_requested(&mut shutdown) => {
                debug!(peer = %peer, "closing idle connection for shutdown");
                break;
            }
        };

        let start = Instant::now();
        writer.take_written();
        let head = match head {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "malformed request head");
                let status = StatusCode::BAD_REQUEST;
                reject(&mut writer, peer, None, status, start, client_timeout, &err).await;
                break;
            }
        };

        debug!(
            peer = %peer,
            method = %head.method,
            target = %head.target,
            header_bytes = head.header_bytes,
            "request received"
        );

        let (path, query) = match split_target(&head.target) {
            Ok(parts) => parts,
            Err(err) => {
                let status = StatusCode::BAD_REQUEST;
                reject(&mut writer, peer, Some(&head), status, start, client_timeout, &err).await;
                break;
            }
        };

        let limit = settings.max_request_body_size as u64;
        let plan = request_body_plan(&head);
        if let BodyPlan::Fixed(length) = plan
            && length > limit
        {
            let err = anyhow!(BodyTooLarge { limit });
            reject(
                &mut writer,
                peer,
                Some(&head),
                StatusCode::PAYLOAD_TOO_LARGE,
                start,
                client_timeout,
                &err,
            )
            .await;
            break;
        }

        if plan != BodyPlan::Empty && expects_continue(&head) {
            timeout_with_context(
                client_timeout,
                writer.write_all(CONTINUE_RESPONSE),
                "writing 100 Continue",
            )
            .await?;
            timeout_with_context(client_timeout, writer.flush(), "flushing 100 Continue").await?;
        }

        let body = match read_body(&mut reader, plan, client_timeout, peer, Some(limit)).await {
            Ok(body) => body,
            Err(err) => {
                let status = if err.is::<BodyTooLarge>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                reject(
                    &mut writer,
                    peer,
                    Some(&head),
                    status,
                    start,
                    client_timeout,
                    &err,
                )
                .await;
                break;
            }
        };

        let close =
            head.version == Version::HTTP_10 || wants_close(&head.headers) || *shutdown.borrow();

        if path == HEALTH_PATH {
            send_response(
                &mut writer,
                StatusCode::OK,
                b"ok",
                head.method == Method::HEAD,
                close,
                client_timeout,
            )
            .await?;
            if close {
                break;
            }
            continue;
        }

        let display_path = match &query {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        let request = ClientRequest {
            method: head.method,
            path,
            query,
            headers: head.headers,
            body,
            peer,
        };
        let report = app.forwarder.handle(&request, &mut writer, close).await;

        let mut access = AccessLogBuilder::new(peer)
            .method(request.method.as_str())
            .path(display_path)
            .status(report.status)
            .cache_status(report.cache.map(|status| status.as_str()))
            .elapsed(start.elapsed());
        if settings.debug_logging() {
            access = access.bytes_out(writer.written());
        }
        if let Some(err) = &report.error {
            access = access.error_reason(err.to_string());
        }
        access.log();

        if report.close {
            break;
        }
    }

    if let Err(err) = shutdown_stream(&mut writer, client_timeout).await {
        debug!(peer = %peer, error = %err, "client shutdown failed");
    }
    Ok(())
}

/// Resolves once shutdown is signalled. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Answers a request the proxy refuses to forward and records it. The connection is closed
/// afterwards, so write failures are only logged.
async fn reject<W>(
    writer: &mut CountingWriter<W>,
    peer: SocketAddr,
    head: Option<&RequestHead>,
    status: StatusCode,
    start: Instant,
    timeout_dur: Duration,
    err: &anyhow::Error,
) where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", status.canonical_reason().unwrap_or("Error"));
    let head_only = head.is_some_and(|head| head.method == Method::HEAD);
    if let Err(write_err) =
        send_response(writer, status, body.as_bytes(), head_only, true, timeout_dur).await
    {
        debug!(peer = %peer, error = %write_err, "failed to send error response");
    }

    let mut access = AccessLogBuilder::new(peer)
        .status(status)
        .elapsed(start.elapsed())
        .error_reason(err.to_string());
    if let Some(head) = head {
        access = access.method(head.method.as_str()).path(head.target.clone());
    }
    access.log();
}

fn expects_continue(head: &RequestHead) -> bool {
    head.headers
        .get(EXPECT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
}

/// Splits an origin-form or absolute-form target into path and query. Only the path and query
/// of an absolute-form target are used; the origin is fixed.
fn split_target(target: &str) -> Result<(String, Option<String>)> {
    let uri: Uri = target
        .parse()
        .map_err(|err| anyhow!("invalid request target {target:?}: {err}"))?;
    let path = uri.path();
    if !path.starts_with('/') {
        bail!("unsupported request target {target:?}");
    }
    let query = uri
        .query()
        .filter(|query| !query.is_empty())
        .map(str::to_owned);
    Ok((path.to_string(), query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_target_splits_query() {
        let (path, query) = split_target("/items?page=2").unwrap();
        assert_eq!(path, "/items");
        assert_eq!(query.as_deref(), Some("page=2"));
    }

    #[test]
    fn empty_query_is_dropped() {
        let (path, query) = split_target("/items?").unwrap();
        assert_eq!(path, "/items");
        assert!(query.is_none());
    }

    #[test]
    fn absolute_form_uses_path_only() {
        let (path, query) = split_target("http://elsewhere.test:81/a/b?x=1").unwrap();
        assert_eq!(path, "/a/b");
        assert_eq!(query.as_deref(), Some("x=1"));

        let (path, query) = split_target("http://elsewhere.test").unwrap();
        assert_eq!(path, "/");
        assert!(query.is_none());
    }

    #[test]
    fn asterisk_and_garbage_targets_are_rejected() {
        assert!(split_target("*").is_err());
        assert!(split_target("not a target").is_err());
    }
}
