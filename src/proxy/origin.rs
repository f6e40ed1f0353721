use std::fmt;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Uri;
use http::uri::Scheme as UriScheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The single upstream server every proxied request is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    authority: String,
    host: String,
    port: u16,
    base_path: String,
}

impl Origin {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        ensure!(!trimmed.is_empty(), "origin must not be empty");
        let uri: Uri = trimmed
            .parse()
            .with_context(|| format!("invalid origin URL '{trimmed}'"))?;

        let scheme = match uri.scheme() {
            Some(scheme) if *scheme == UriScheme::HTTP => Scheme::Http,
            Some(scheme) if *scheme == UriScheme::HTTPS => Scheme::Https,
            Some(other) => bail!("origin scheme must be http or https (got '{other}')"),
            None => bail!("origin '{trimmed}' must include a scheme (http:// or https://)"),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("origin '{trimmed}' must include a host"))?;
        ensure!(
            !authority.as_str().contains('@'),
            "origin must not include user credentials"
        );
        let host = authority.host();
        ensure!(!host.is_empty(), "origin '{trimmed}' must include a host");
        ensure!(
            uri.query().is_none(),
            "origin must not include a query string"
        );

        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());
        // Uri normalizes an empty path to "/", which joins identically to an empty base.
        let base_path = uri.path().to_string();

        Ok(Self {
            scheme,
            authority: authority.as_str().to_string(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            base_path,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP literal without brackets, suitable for resolution and TLS SNI.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value sent as the Host header on every upstream request.
    pub fn host_header(&self) -> &str {
        &self.authority
    }

    /// Request target sent upstream: the base path joined with `path`, plus the raw query.
    pub fn upstream_target(&self, path: &str, query: Option<&str>) -> String {
        let mut target = single_joining_slash(&self.base_path, path);
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Fully qualified URL the request resolves to at the origin.
    pub fn resolved_url(&self, path: &str, query: Option<&str>) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority,
            self.upstream_target(path, query)
        )
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority,
            self.base_path
        )
    }
}

pub(crate) fn single_joining_slash(base: &str, path: &str) -> String {
    let base_slash = base.ends_with('/');
    let path_slash = path.starts_with('/');
    match (base_slash, path_slash) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
