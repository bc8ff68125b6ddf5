//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check listen targets and proxy routes are well formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{ServerConfig, TlsConfig, UNIX_SCHEME};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration for semantic errors.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.hostname.trim().is_empty() {
        errors.push(ValidationError::new("hostname", "must not be empty"));
    } else if let Some(path) = config.hostname.strip_prefix(UNIX_SCHEME) {
        if path.is_empty() {
            errors.push(ValidationError::new("hostname", "unix socket path is empty"));
        }
        if config.tls.is_enabled() {
            errors.push(ValidationError::new(
                "tls",
                "TLS is not supported on unix domain sockets",
            ));
        }
    }

    if let Some(path) = &config.readiness_path {
        if !path.starts_with('/') {
            errors.push(ValidationError::new("readiness_path", "must start with '/'"));
        }
    }

    if let TlsConfig::Files { cert_path, key_path } = &config.tls {
        if cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
        }
        if key_path.as_os_str().is_empty() {
            errors.push(ValidationError::new("tls.key_path", "must not be empty"));
        }
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.read_secs", timeouts.read_secs),
        ("timeouts.write_secs", timeouts.write_secs),
        ("timeouts.handshake_secs", timeouts.handshake_secs),
        ("timeouts.keep_alive_secs", timeouts.keep_alive_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    let limits = &config.limits;
    if limits.max_connections == 0 {
        errors.push(ValidationError::new("limits.max_connections", "must be greater than 0"));
    }
    if limits.max_header_count == 0 {
        errors.push(ValidationError::new("limits.max_header_count", "must be greater than 0"));
    }
    if limits.max_line_size < 64 {
        errors.push(ValidationError::new("limits.max_line_size", "must be at least 64 bytes"));
    }

    if config.reloader.interval_ms == 0 {
        errors.push(ValidationError::new("reloader.interval_ms", "must be greater than 0"));
    }

    for (i, route) in config.proxy.iter().enumerate() {
        if !route.prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("proxy[{i}].prefix"),
                "must start with '/'",
            ));
        }
        match url::Url::parse(&route.target) {
            Ok(url) if url.scheme() == "http" && url.host_str().is_some() => {}
            Ok(_) => errors.push(ValidationError::new(
                format!("proxy[{i}].target"),
                "only http:// targets with a host are supported",
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("proxy[{i}].target"),
                e.to_string(),
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyRouteConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn tls_on_unix_socket_rejected() {
        let config = ServerConfig {
            hostname: "unix:///tmp/dev.sock".into(),
            tls: TlsConfig::Adhoc,
            ..Default::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "tls");
    }

    #[test]
    fn https_proxy_target_rejected() {
        let mut config = ServerConfig::default();
        config.proxy.push(ProxyRouteConfig {
            prefix: "/api".into(),
            target: "https://example.test".into(),
            host: None,
            preserve_host: false,
            remove_prefix: false,
            headers: Default::default(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "proxy[0].target");
    }
}
