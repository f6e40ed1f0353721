//! Cache-aware forwarding: decides hit, miss or bypass for one client request and writes the
//! response to the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::metrics::{self, LookupResult};
use crate::proxy::cache::{CacheKey, CacheStore, Entry};
use crate::proxy::headers::{
    CACHE_STATUS_HEADER, has_authorization, is_no_store, strip_hop_by_hop,
};
use crate::proxy::http::body::{BodyPlan, read_body, relay_body, response_body_plan};
use crate::proxy::http::codec::{ResponseHead, encode_response_head};
use crate::proxy::http::respond::send_response;
use crate::proxy::http::upstream::{
    OriginConnector, UpstreamIo, build_upstream_request, read_final_response_head, send_request,
    upstream_headers,
};
use crate::util::timeout_with_context;

const BAD_GATEWAY_BODY: &[u8] = b"Bad Gateway\n";

/// A fully read client request, body included.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: SocketAddr,
}

/// Value written to the `X-Cache` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }

    fn header_value(&self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    Authorization,
    NoStore,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Method => "method",
            BypassReason::Authorization => "authorization",
            BypassReason::NoStore => "no_store",
        }
    }
}

/// Whether a request may be answered from, or recorded into, the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEligibility {
    Eligible,
    Bypass(BypassReason),
}

impl CacheEligibility {
    pub fn evaluate(method: &Method, headers: &HeaderMap) -> Self {
        if method != Method::GET {
            CacheEligibility::Bypass(BypassReason::Method)
        } else if has_authorization(headers) {
            CacheEligibility::Bypass(BypassReason::Authorization)
        } else if is_no_store(headers) {
            CacheEligibility::Bypass(BypassReason::NoStore)
        } else {
            CacheEligibility::Eligible
        }
    }
}

/// What happened while answering one request, for access logging and connection reuse.
#[derive(Debug)]
pub struct ForwardReport {
    pub status: StatusCode,
    pub cache: Option<CacheStatus>,
    /// The client connection must not be reused.
    pub close: bool,
    pub error: Option<Error>,
}

impl ForwardReport {
    fn completed(status: StatusCode, cache: Option<CacheStatus>, close: bool) -> Self {
        Self {
            status,
            cache,
            close,
            error: None,
        }
    }

    fn failed(status: StatusCode, cache: Option<CacheStatus>, error: Error) -> Self {
        Self {
            status,
            cache,
            close: true,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardTimeouts {
    pub client_write: Duration,
    pub upstream_io: Duration,
}

/// Where an origin exchange failed; used as the `upstream_errors_total` label.
#[derive(Debug, Clone, Copy)]
enum UpstreamStage {
    Connect,
    Request,
    ResponseHead,
    ResponseBody,
}

impl UpstreamStage {
    fn as_str(&self) -> &'static str {
        match self {
            UpstreamStage::Connect => "connect",
            UpstreamStage::Request => "request",
            UpstreamStage::ResponseHead => "response_head",
            UpstreamStage::ResponseBody => "response_body",
        }
    }
}

struct OriginResponse {
    reader: BufReader<UpstreamIo>,
    head: ResponseHead,
    peer: SocketAddr,
}

pub struct Forwarder {
    connector: OriginConnector,
    store: Option<Arc<dyn CacheStore>>,
    timeouts: ForwardTimeouts,
    max_response_header_bytes: usize,
}

impl Forwarder {
    pub(crate) fn new(
        connector: OriginConnector,
        store: Option<Arc<dyn CacheStore>>,
        timeouts: ForwardTimeouts,
        max_response_header_bytes: usize,
    ) -> Self {
        Self {
            connector,
            store,
            timeouts,
            max_response_header_bytes,
        }
    }

    /// Answers `request` on `client`. `close` asks for `Connection: close` on the response.
    pub async fn handle<W>(
        &self,
        request: &ClientRequest,
        client: &mut W,
        close: bool,
    ) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        let eligibility = CacheEligibility::evaluate(&request.method, &request.headers);
        let store = match (eligibility, &self.store) {
            (CacheEligibility::Eligible, Some(store)) => store,
            (CacheEligibility::Bypass(reason), Some(_)) => {
                debug!(
                    method = %request.method,
                    path = %request.path,
                    reason = reason.as_str(),
                    "bypassing cache"
                );
                return self.forward_uncached(request, client, close).await;
            }
            (_, None) => return self.forward_uncached(request, client, close).await,
        };

        let key = CacheKey::derive(
            self.connector.origin(),
            &request.method,
            &request.path,
            request.query.as_deref(),
            request.headers.get(ACCEPT),
        );
        match store.get(&key).await {
            Ok(Some(entry)) => {
                metrics::record_cache_lookup(LookupResult::Hit);
                return self.write_hit(entry, client, close).await;
            }
            Ok(None) => metrics::record_cache_lookup(LookupResult::Miss),
            Err(err) => {
                metrics::record_cache_lookup(LookupResult::Error);
                warn!(
                    key = %key,
                    backend = store.backend(),
                    error = %err,
                    "cache lookup failed; fetching from origin"
                );
            }
        }
        self.fetch_and_store(request, &**store, &key, client, close)
            .await
    }

    async fn write_hit<W>(&self, entry: Entry, client: &mut W, close: bool) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        let Entry {
            status,
            mut headers,
            body,
        } = entry;
        headers.insert(CACHE_STATUS_HEADER, CacheStatus::Hit.header_value());
        strip_hop_by_hop(&mut headers);
        match self
            .write_buffered(client, status, None, headers, &body, close)
            .await
        {
            Ok(()) => ForwardReport::completed(status, Some(CacheStatus::Hit), close),
            Err(err) => ForwardReport::failed(status, Some(CacheStatus::Hit), err),
        }
    }

    async fn fetch_and_store<W>(
        &self,
        request: &ClientRequest,
        store: &dyn CacheStore,
        key: &CacheKey,
        client: &mut W,
        close: bool,
    ) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        let miss = Some(CacheStatus::Miss);
        let mut origin = match self.exchange(request).await {
            Ok(origin) => origin,
            Err((stage, err)) => return self.bad_gateway(client, stage, err, miss).await,
        };

        let mut headers = std::mem::take(&mut origin.head.headers);
        strip_hop_by_hop(&mut headers);
        let status = origin.head.status;
        let plan = response_body_plan(&request.method, &origin.head);

        if is_no_store(&headers) {
            headers.insert(CACHE_STATUS_HEADER, CacheStatus::Miss.header_value());
            debug!(key = %key, "origin response is no-store; not caching");
            return self.relay(origin, headers, plan, client, close, miss).await;
        }

        let body = match read_body(
            &mut origin.reader,
            plan,
            self.timeouts.upstream_io,
            origin.peer,
            None,
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                return self
                    .bad_gateway(client, UpstreamStage::ResponseBody, err, miss)
                    .await;
            }
        };

        let entry = Entry::from_response(status, headers, body);
        match store.set(key, &entry).await {
            Ok(()) => {
                metrics::record_cache_store();
                debug!(key = %key, status = status.as_u16(), "stored response");
            }
            Err(err) => {
                metrics::record_cache_store_error();
                warn!(
                    key = %key,
                    backend = store.backend(),
                    error = %err,
                    "failed to store response; serving uncached"
                );
            }
        }

        let Entry {
            mut headers, body, ..
        } = entry;
        headers.insert(CACHE_STATUS_HEADER, CacheStatus::Miss.header_value());
        match self
            .write_buffered(
                client,
                status,
                Some(origin.head.reason.as_str()),
                headers,
                &body,
                close,
            )
            .await
        {
            Ok(()) => ForwardReport::completed(status, miss, close),
            Err(err) => ForwardReport::failed(status, miss, err),
        }
    }

    async fn forward_uncached<W>(
        &self,
        request: &ClientRequest,
        client: &mut W,
        close: bool,
    ) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        let mut origin = match self.exchange(request).await {
            Ok(origin) => origin,
            Err((stage, err)) => return self.bad_gateway(client, stage, err, None).await,
        };
        let mut headers = std::mem::take(&mut origin.head.headers);
        strip_hop_by_hop(&mut headers);
        let plan = response_body_plan(&request.method, &origin.head);
        self.relay(origin, headers, plan, client, close, None).await
    }

    /// Streams the origin response through with its own framing.
    async fn relay<W>(
        &self,
        mut origin: OriginResponse,
        headers: HeaderMap,
        plan: BodyPlan,
        client: &mut W,
        close: bool,
        cache: Option<CacheStatus>,
    ) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        let status = origin.head.status;
        let close = close || matches!(plan, BodyPlan::UntilClose);
        let head = encode_response_head(
            status,
            Some(origin.head.reason.as_str()),
            &headers,
            plan,
            close,
        );
        let result = self
            .relay_stream(&mut origin, &head, plan, client)
            .await;
        match result {
            Ok(()) => ForwardReport::completed(status, cache, close),
            Err(err) => ForwardReport::failed(status, cache, err),
        }
    }

    async fn relay_stream<W>(
        &self,
        origin: &mut OriginResponse,
        head: &[u8],
        plan: BodyPlan,
        client: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        timeout_with_context(
            self.timeouts.client_write,
            client.write_all(head),
            "writing response head to client",
        )
        .await?;
        relay_body(
            &mut origin.reader,
            client,
            plan,
            self.timeouts.upstream_io,
            self.timeouts.client_write,
            origin.peer,
        )
        .await?;
        timeout_with_context(
            self.timeouts.client_write,
            client.flush(),
            "flushing response to client",
        )
        .await
    }

    async fn write_buffered<W>(
        &self,
        client: &mut W,
        status: StatusCode,
        reason: Option<&str>,
        mut headers: HeaderMap,
        body: &[u8],
        close: bool,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let plan = if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            headers.remove(CONTENT_LENGTH);
            BodyPlan::Empty
        } else {
            BodyPlan::Fixed(body.len() as u64)
        };
        let head = encode_response_head(status, reason, &headers, plan, close);
        timeout_with_context(
            self.timeouts.client_write,
            client.write_all(&head),
            "writing response head to client",
        )
        .await?;
        if matches!(plan, BodyPlan::Fixed(_)) && !body.is_empty() {
            timeout_with_context(
                self.timeouts.client_write,
                client.write_all(body),
                "writing response body to client",
            )
            .await?;
        }
        timeout_with_context(
            self.timeouts.client_write,
            client.flush(),
            "flushing response to client",
        )
        .await
    }

    /// Sends the request to the origin and reads the final response head.
    async fn exchange(
        &self,
        request: &ClientRequest,
    ) -> Result<OriginResponse, (UpstreamStage, Error)> {
        let origin = self.connector.origin();
        let target = origin.upstream_target(&request.path, request.query.as_deref());
        let headers = upstream_headers(&request.headers, request.peer);
        let head = build_upstream_request(
            &request.method,
            &target,
            origin.host_header(),
            &headers,
            request.body.len(),
        );

        let (mut io, peer) = self
            .connector
            .connect()
            .await
            .map_err(|err| (UpstreamStage::Connect, err))?;
        send_request(&mut io, &head, &request.body, self.timeouts.upstream_io)
            .await
            .map_err(|err| (UpstreamStage::Request, err))?;

        let mut reader = BufReader::new(io);
        let head = read_final_response_head(
            &mut reader,
            self.timeouts.upstream_io,
            peer,
            self.max_response_header_bytes,
        )
        .await
        .map_err(|err| (UpstreamStage::ResponseHead, err))?;
        debug!(
            upstream = %peer,
            status = head.status.as_u16(),
            version = ?head.version,
            origin_close = head.connection_close,
            "origin responded"
        );
        Ok(OriginResponse { reader, head, peer })
    }

    async fn bad_gateway<W>(
        &self,
        client: &mut W,
        stage: UpstreamStage,
        err: Error,
        cache: Option<CacheStatus>,
    ) -> ForwardReport
    where
        W: AsyncWrite + Unpin,
    {
        metrics::record_upstream_error(stage.as_str());
        warn!(
            origin = %self.connector.origin(),
            stage = stage.as_str(),
            error = %format!("{err:#}"),
            "origin request failed"
        );
        if let Err(write_err) = send_response(
            client,
            StatusCode::BAD_GATEWAY,
            BAD_GATEWAY_BODY,
            false,
            true,
            self.timeouts.client_write,
        )
        .await
        {
            debug!(error = %write_err, "failed to deliver 502 to client");
        }
        ForwardReport::failed(StatusCode::BAD_GATEWAY, cache, err.context(stage.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn get_without_credentials_is_eligible() {
        assert_eq!(
            CacheEligibility::evaluate(&Method::GET, &headers(&[("accept", "*/*")])),
            CacheEligibility::Eligible
        );
        assert_eq!(
            CacheEligibility::evaluate(&Method::GET, &headers(&[("authorization", "")])),
            CacheEligibility::Eligible
        );
    }

    #[test]
    fn bypass_reasons() {
        assert_eq!(
            CacheEligibility::evaluate(&Method::POST, &HeaderMap::new()),
            CacheEligibility::Bypass(BypassReason::Method)
        );
        assert_eq!(
            CacheEligibility::evaluate(&Method::HEAD, &HeaderMap::new()),
            CacheEligibility::Bypass(BypassReason::Method)
        );
        assert_eq!(
            CacheEligibility::evaluate(&Method::GET, &headers(&[("authorization", "Bearer t")])),
            CacheEligibility::Bypass(BypassReason::Authorization)
        );
        assert_eq!(
            CacheEligibility::evaluate(
                &Method::GET,
                &headers(&[("cache-control", "max-age=0, No-Store")])
            ),
            CacheEligibility::Bypass(BypassReason::NoStore)
        );
    }

    #[test]
    fn cache_status_values() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
    }
}
