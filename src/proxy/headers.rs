use std::net::IpAddr;

use http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, HeaderName, HeaderValue};
use http::HeaderMap;

/// Response header carrying the cache outcome.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache");

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes connection-scoped headers in place: the fixed hop-by-hop set plus any header the
/// `Connection` header nominates. Applying it twice is a no-op.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_nominated(headers) {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn connection_nominated(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect()
}

/// Case-insensitive, comma-separated token match over every `Cache-Control` value.
/// Directives with arguments (`max-age=60`) match on their name.
pub fn has_cache_directive(headers: &HeaderMap, directive: &str) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.split_once('=').map_or(token, |(name, _)| name).trim())
        .any(|name| name.eq_ignore_ascii_case(directive))
}

pub fn is_no_store(headers: &HeaderMap) -> bool {
    has_cache_directive(headers, "no-store")
}

pub fn has_authorization(headers: &HeaderMap) -> bool {
    headers
        .get_all(AUTHORIZATION)
        .iter()
        .any(|value| !value.is_empty())
}

/// True when the client's `Connection` header asks to close after this exchange.
pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Appends the client address to `X-Forwarded-For`, folding any prior values into one line.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    let combined = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {client}", prior.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
