use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::CONTENT_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A cached response snapshot. Never mutated once stored; a fresh fetch replaces it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Entry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Builds the entry recorded for a buffered origin response, pinning Content-Length to the
    /// buffered body.
    pub fn from_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Self {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status,
            headers,
            body,
        }
    }

    pub(super) fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            status: self.status.as_u16(),
            headers: headermap_to_persisted(&self.headers),
            body: BASE64.encode(&self.body),
        }
    }

    pub(super) fn from_persisted(persisted: PersistedEntry) -> Result<Self, EntryDecodeError> {
        let status = StatusCode::from_u16(persisted.status)
            .map_err(|_| EntryDecodeError::Status(persisted.status))?;
        let headers = persisted_to_headermap(&persisted.headers)?;
        let body = BASE64
            .decode(persisted.body.as_bytes())
            .map_err(EntryDecodeError::Body)?;
        Ok(Self {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum EntryDecodeError {
    #[error("invalid status code {0}")]
    Status(u16),
    #[error("invalid header name '{0}'")]
    HeaderName(String),
    #[error("invalid value for header '{0}'")]
    HeaderValue(String),
    #[error("body is not valid base64")]
    Body(#[source] base64::DecodeError),
}

fn headermap_to_persisted(map: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut items: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items
                .entry(name.as_str().to_string())
                .or_default()
                .push(value_str.to_string());
        }
    }
    items
}

fn persisted_to_headermap(
    items: &BTreeMap<String, Vec<String>>,
) -> Result<HeaderMap, EntryDecodeError> {
    let mut map = HeaderMap::new();
    for (name, values) in items {
        let header_name = HeaderName::try_from(name.as_str())
            .map_err(|_| EntryDecodeError::HeaderName(name.clone()))?;
        for value in values {
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| EntryDecodeError::HeaderValue(name.clone()))?;
            map.append(header_name.clone(), header_value);
        }
    }
    Ok(map)
}
