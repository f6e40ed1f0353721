use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::proxy::http::codec::read_request_head;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total proxied requests by cache status");
    let vec = IntCounterVec::new(opts, &["cache"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency")
        .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register request_duration_seconds");
    histogram
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Entries written to the cache")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Failed cache writes")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Origin errors by kind"),
        &["kind"],
    )
    .expect("create upstream_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Lookup outcome label for `cache_lookup_total`.
#[derive(Debug, Clone, Copy)]
pub enum LookupResult {
    Hit,
    Miss,
    Error,
}

impl LookupResult {
    fn as_str(&self) -> &'static str {
        match self {
            LookupResult::Hit => "hit",
            LookupResult::Miss => "miss",
            LookupResult::Error => "error",
        }
    }
}

pub fn record_request(
    cache: Option<&str>,
    method: &str,
    status: StatusCode,
    elapsed: Duration,
) {
    REQUESTS_TOTAL
        .with_label_values(&[cache.unwrap_or("none")])
        .inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    REQUEST_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: LookupResult) {
    CACHE_LOOKUP_TOTAL
        .with_label_values(&[result.as_str()])
        .inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the Prometheus text exposition at `/metrics` until the listener fails.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(listen = %addr, "metrics listener started");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, peer, METRICS_MAX_REQUEST_BYTES).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, peer: SocketAddr, max_bytes: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(head) = read_request_head(
        &mut reader,
        peer,
        METRICS_READ_TIMEOUT,
        METRICS_READ_TIMEOUT,
        max_bytes,
    )
    .await?
    else {
        return Ok(());
    };

    let path = head.target.split('?').next().unwrap_or_default();
    let response = if head.method == Method::GET && path == "/metrics" {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn record_basic_metrics() {
        record_request(Some("HIT"), "GET", StatusCode::OK, Duration::from_millis(10));
        record_cache_lookup(LookupResult::Miss);
        record_upstream_error("connect");
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(
            text.contains("requests_total"),
            "expected requests_total in metrics output"
        );
        assert!(text.contains("cache_lookup_total{result=\"miss\"}"));
        assert!(text.contains("upstream_errors_total{kind=\"connect\"}"));
    }

    #[tokio::test]
    async fn serves_metrics_path() -> Result<()> {
        record_cache_store();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await?;
        handle_stream(server, peer(), 1024).await?;

        let mut response = String::new();
        client.read_to_string(&mut response).await?;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("cache_store_total"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() -> Result<()> {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"GET /other HTTP/1.1\r\n\r\n").await?;
        handle_stream(server, peer(), 1024).await?;

        let mut response = String::new();
        client.read_to_string(&mut response).await?;
        assert!(response.starts_with("HTTP/1.1 404"));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_oversized_request() {
        let (mut client, server) = tokio::io::duplex(1024);
        let oversized = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64));
        client.write_all(oversized.as_bytes()).await.unwrap();
        drop(client);

        let err = handle_stream(server, peer(), 32)
            .await
            .expect_err("oversized request should be rejected");
        assert!(
            err.to_string().contains("exceeds configured limit"),
            "unexpected error: {err}"
        );
    }
}
