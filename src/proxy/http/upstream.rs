use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::{CONTENT_LENGTH, EXPECT, HOST};
use http::{HeaderMap, Method, StatusCode};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::proxy::headers::{append_forwarded_for, strip_hop_by_hop};
use crate::proxy::http::codec::{ResponseHead, read_response_head};
use crate::proxy::origin::{Origin, Scheme};
use crate::util::{client_ip, timeout_with_context};

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Unpin for UpstreamIo {}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens one fresh connection to the configured origin per request.
pub(crate) struct OriginConnector {
    origin: Arc<Origin>,
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
}

impl OriginConnector {
    pub fn new(
        origin: Arc<Origin>,
        tls: Option<Arc<ClientConfig>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            origin,
            tls,
            connect_timeout,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub async fn connect(&self) -> Result<(UpstreamIo, SocketAddr)> {
        let host = self.origin.host();
        let port = self.origin.port();
        let addresses: Vec<SocketAddr> = timeout_with_context(
            self.connect_timeout,
            tokio::net::lookup_host((host, port)),
            format!("resolving origin {host}"),
        )
        .await?
        .collect();
        let (tcp, peer) = connect_to_addrs(&addresses, self.connect_timeout).await?;

        let stream = match self.origin.scheme() {
            Scheme::Http => UpstreamIo::Plain(tcp),
            Scheme::Https => {
                let config = self
                    .tls
                    .clone()
                    .ok_or_else(|| anyhow!("TLS client configuration missing for https origin"))?;
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| anyhow!("invalid origin host for TLS '{host}'"))?;
                let connector = TlsConnector::from(config);
                let tls = timeout(self.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with origin timed out"))?
                    .with_context(|| format!("failed to establish TLS with origin {host}:{port}"))?;
                UpstreamIo::Tls(Box::new(tls))
            }
        };
        Ok((stream, peer))
    }
}

/// Attempt each address in turn until one accepts.
pub(crate) async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to origin");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err =
                    Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses resolved for origin")))
}

/// Client request headers as they go to the origin: connection-scoped headers, `Host`,
/// `Content-Length` and `Expect` removed; the client appended to `X-Forwarded-For`.
pub(crate) fn upstream_headers(client_headers: &HeaderMap, client: SocketAddr) -> HeaderMap {
    let mut headers = client_headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(EXPECT);
    append_forwarded_for(&mut headers, client_ip(client.ip()));
    headers
}

pub(crate) fn build_upstream_request(
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body_len: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");

    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(host.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: close\r\n");
    if body_len > 0 || *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
    {
        buffer.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

pub(crate) async fn send_request<S>(
    upstream: &mut S,
    head: &[u8],
    body: &[u8],
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        write_timeout,
        upstream.write_all(head),
        "sending request headers to origin",
    )
    .await?;
    if !body.is_empty() {
        timeout_with_context(
            write_timeout,
            upstream.write_all(body),
            "sending request body to origin",
        )
        .await?;
    }
    timeout_with_context(write_timeout, upstream.flush(), "flushing request to origin").await
}

/// Reads response heads until a final (non-1xx) one arrives. Interim responses are dropped;
/// `101 Switching Protocols` is an error since upgrades are not relayed.
pub(crate) async fn read_final_response_head<S>(
    reader: &mut BufReader<S>,
    header_timeout: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_response_head(reader, header_timeout, peer, max_header_bytes).await?;
        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            bail!("origin attempted protocol upgrade (101 Switching Protocols)");
        }
        if !head.status.is_informational() {
            return Ok(head);
        }
        ensure!(
            !head.chunked && head.content_length.is_none_or(|length| length == 0),
            "informational response must not include a body"
        );
        debug!(peer = %peer, status = head.status.as_u16(), "skipping interim response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use tokio::io::duplex;

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }

    #[test]
    fn upstream_headers_drop_connection_scoped_fields() {
        let mut client = HeaderMap::new();
        client.insert("host", HeaderValue::from_static("proxy.local"));
        client.insert("connection", HeaderValue::from_static("x-trace"));
        client.insert("x-trace", HeaderValue::from_static("1"));
        client.insert("expect", HeaderValue::from_static("100-continue"));
        client.insert("content-length", HeaderValue::from_static("3"));
        client.insert("accept", HeaderValue::from_static("*/*"));

        let headers = upstream_headers(&client, "10.1.2.3:5555".parse().unwrap());
        assert!(!headers.contains_key("host"));
        assert!(!headers.contains_key("x-trace"));
        assert!(!headers.contains_key("expect"));
        assert!(!headers.contains_key("content-length"));
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.1.2.3");
    }

    #[test]
    fn request_carries_origin_host_and_close() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        let encoded =
            build_upstream_request(&Method::GET, "/base/items?x=1", "origin:8080", &headers, 0);
        assert!(encoded.starts_with(b"GET /base/items?x=1 HTTP/1.1\r\nHost: origin:8080\r\n"));
        assert!(contains(&encoded, "accept: text/html\r\n"));
        assert!(contains(&encoded, "Connection: close\r\n"));
        assert!(!contains(&encoded, "Content-Length"));
    }

    #[test]
    fn empty_post_sends_zero_length() {
        let encoded =
            build_upstream_request(&Method::POST, "/", "origin", &HeaderMap::new(), 0);
        assert!(contains(&encoded, "Content-Length: 0\r\n"));

        let encoded = build_upstream_request(&Method::DELETE, "/", "origin", &HeaderMap::new(), 4);
        assert!(contains(&encoded, "Content-Length: 4\r\n"));
    }

    #[tokio::test]
    async fn skips_interim_responses() -> Result<()> {
        let (mut origin, proxy_side) = duplex(256);
        origin
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await?;
        drop(origin);

        let mut reader = BufReader::new(proxy_side);
        let head = read_final_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:8080".parse()?,
            256,
        )
        .await?;
        assert_eq!(head.status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_switching_protocols() -> Result<()> {
        let (mut origin, proxy_side) = duplex(256);
        origin
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .await?;
        drop(origin);

        let mut reader = BufReader::new(proxy_side);
        match read_final_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:8080".parse()?,
            256,
        )
        .await
        {
            Ok(_) => panic!("expected switching protocols response to be rejected"),
            Err(err) => assert!(err.to_string().contains("Switching Protocols")),
        }
        Ok(())
    }

    #[tokio::test]
    async fn connect_reports_refused_origin() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let err = connect_to_addrs(&[addr], Duration::from_secs(1))
            .await
            .expect_err("closed port must fail");
        assert!(
            err.to_string().contains("failed to connect")
                || err.to_string().contains("timed out"),
            "unexpected error: {err}"
        );
        Ok(())
    }
}
