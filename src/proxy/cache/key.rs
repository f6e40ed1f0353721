use std::fmt;
use std::path::{Path, PathBuf};

use http::{HeaderValue, Method};

use crate::proxy::origin::Origin;

pub(super) const ENTRY_EXTENSION: &str = "json";

/// Opaque cache identifier: the hex blake3 digest of method, resolved URL, and `Accept`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(
        origin: &Origin,
        method: &Method,
        path: &str,
        query: Option<&str>,
        accept: Option<&HeaderValue>,
    ) -> Self {
        let url = origin.resolved_url(path, query);
        let mut hasher = blake3::Hasher::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        if let Some(accept) = accept {
            hasher.update(accept.as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<root>/<key[0:2]>/<key[2:4]>/<key>.json`
    pub fn shard_path(&self, root: &Path) -> PathBuf {
        let (first, rest) = self.0.split_at(2);
        let (second, _) = rest.split_at(2);
        root.join(first)
            .join(second)
            .join(format!("{}.{ENTRY_EXTENSION}", self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::parse("http://origin.test:8080/api").unwrap()
    }

    fn key(method: Method, path: &str, query: Option<&str>, accept: Option<&str>) -> CacheKey {
        let accept = accept.map(|value| HeaderValue::from_str(value).unwrap());
        CacheKey::derive(&origin(), &method, path, query, accept.as_ref())
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = key(Method::GET, "/items", Some("page=2"), Some("application/json"));
        let b = key(Method::GET, "/items", Some("page=2"), Some("application/json"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn any_component_changes_the_key() {
        let base = key(Method::GET, "/items", Some("page=2"), Some("application/json"));
        let variants = [
            key(Method::HEAD, "/items", Some("page=2"), Some("application/json")),
            key(Method::GET, "/items/1", Some("page=2"), Some("application/json")),
            key(Method::GET, "/items", Some("page=3"), Some("application/json")),
            key(Method::GET, "/items", None, Some("application/json")),
            key(Method::GET, "/items", Some("page=2"), Some("text/html")),
            key(Method::GET, "/items", Some("page=2"), None),
        ];
        for variant in &variants {
            assert_ne!(&base, variant);
        }
    }

    #[test]
    fn key_covers_origin_base_path() {
        let other = Origin::parse("http://origin.test:8080/other").unwrap();
        let a = CacheKey::derive(&origin(), &Method::GET, "/items", None, None);
        let b = CacheKey::derive(&other, &Method::GET, "/items", None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn key_matches_expected_material() {
        let derived = key(Method::GET, "/items", Some("a=1"), Some("*/*"));
        let expected = blake3::hash(b"GET\nhttp://origin.test:8080/api/items?a=1\n*/*");
        assert_eq!(derived.as_str(), expected.to_hex().as_str());
    }

    #[test]
    fn shard_path_uses_two_level_prefix() {
        let key = key(Method::GET, "/items", None, None);
        let root = Path::new("/var/cache/proxy");
        let path = key.shard_path(root);
        let hex = key.as_str();
        assert_eq!(
            path,
            root.join(&hex[0..2])
                .join(&hex[2..4])
                .join(format!("{hex}.json"))
        );
    }
}
