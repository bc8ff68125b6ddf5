//! Proxy routing table.
//!
//! # Responsibilities
//! - Normalize configured prefixes to `/<prefix>/`
//! - Match request paths against prefixes in table order
//! - Compute the backend path and Host header for a matched route
//!
//! # Design Decisions
//! - Path matching is case-sensitive and prefix-only; no regex
//! - First match wins, so more specific prefixes belong earlier

use http::header::{HeaderName, HeaderValue};
use url::Url;

use crate::config::ProxyRouteConfig;
use crate::proxy::ProxyError;

/// Which Host header the backend receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRewrite {
    /// The target URL's host (without port).
    Target,
    /// A fixed value.
    Override(String),
    /// The client's own Host header.
    Preserve,
}

/// One validated routing entry.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    prefix: String,
    target: Url,
    host: HostRewrite,
    remove_prefix: bool,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ProxyRoute {
    pub fn from_config(config: &ProxyRouteConfig) -> Result<Self, ProxyError> {
        let target = Url::parse(&config.target).map_err(|e| ProxyError::InvalidTarget {
            target: config.target.clone(),
            reason: e.to_string(),
        })?;
        if target.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme(target.scheme().to_string()));
        }
        if target.host_str().is_none() {
            return Err(ProxyError::InvalidTarget {
                target: config.target.clone(),
                reason: "missing host".to_string(),
            });
        }

        let host = match (&config.host, config.preserve_host) {
            (_, true) => HostRewrite::Preserve,
            (Some(host), false) => HostRewrite::Override(host.clone()),
            (None, false) => HostRewrite::Target,
        };

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let invalid = || ProxyError::InvalidHeader { name: name.clone() };
                Ok((
                    HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?,
                    HeaderValue::from_str(value).map_err(|_| invalid())?,
                ))
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;

        Ok(Self {
            prefix: normalize_prefix(&config.prefix),
            target,
            host,
            remove_prefix: config.remove_prefix,
            headers,
        })
    }

    /// Normalized prefix, always `/<segment...>/`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn host_rewrite(&self) -> &HostRewrite {
        &self.host
    }

    /// Headers added to every forwarded request.
    pub fn extra_headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Path sent to the backend for a matched request path.
    pub fn backend_path(&self, path: &str) -> String {
        let rest = if self.remove_prefix {
            path.get(self.prefix.len()..).unwrap_or_default()
        } else {
            path
        };
        format!(
            "{}/{}",
            self.target.path().trim_end_matches('/'),
            rest.trim_start_matches('/')
        )
    }

    /// Host header for the backend; `client_host` is the incoming Host.
    pub fn backend_host(&self, client_host: Option<&str>) -> Option<String> {
        match &self.host {
            HostRewrite::Target => self.target.host_str().map(str::to_string),
            HostRewrite::Override(host) => Some(host.clone()),
            HostRewrite::Preserve => client_host.map(str::to_string),
        }
    }

    /// `host[:port]` of the target, for the request URI.
    pub fn authority(&self) -> String {
        let host = self.target.host_str().unwrap_or_default();
        match self.target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Ordered prefix table.
#[derive(Debug, Clone, Default)]
pub struct ProxyTable {
    routes: Vec<ProxyRoute>,
}

impl ProxyTable {
    pub fn from_config(routes: &[ProxyRouteConfig]) -> Result<Self, ProxyError> {
        let routes = routes
            .iter()
            .map(ProxyRoute::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { routes })
    }

    /// First route whose prefix matches `path`.
    pub fn match_path(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
