//! Relay one request to a backend and stream its response back.

use std::io;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};

use crate::app::AppError;
use crate::http::environ::Environ;
use crate::http::response::{Body, Response};
use crate::proxy::router::ProxyRoute;
use crate::proxy::ProxyError;

/// HTTP client used for backend requests.
pub type BackendClient = Client<HttpConnector, axum::body::Body>;

/// Headers meaningful only for a single connection.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || connection_tokens.iter().any(|t| name.eq_ignore_ascii_case(t))
}

fn connection_tokens(value: Option<&str>) -> Vec<String> {
    value
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Percent-encode a decoded path, keeping `/` separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Build the backend request for a matched route.
pub fn build_request(
    route: &ProxyRoute,
    environ: &Environ<'_>,
    body: bytes::Bytes,
) -> Result<Request<axum::body::Body>, ProxyError> {
    let mut uri = format!(
        "http://{}{}",
        route.authority(),
        encode_path(&route.backend_path(environ.path_info()))
    );
    if !environ.query_string().is_empty() {
        uri.push('?');
        uri.push_str(environ.query_string());
    }
    let uri: Uri = uri.parse().map_err(|e: http::uri::InvalidUri| ProxyError::InvalidTarget {
        target: route.target().to_string(),
        reason: e.to_string(),
    })?;

    let method = Method::from_bytes(environ.method().as_bytes()).unwrap_or_default();
    let mut builder = Request::builder().method(method).uri(uri);

    let tokens = connection_tokens(environ.header("connection"));
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in environ.headers() {
            if is_hop_by_hop(&name, &tokens)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        if let Some(host) = route.backend_host(environ.header("host")) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(header::HOST, value);
            }
        }

        for (name, value) in route.extra_headers() {
            headers.insert(name.clone(), value.clone());
        }
    }

    Ok(builder.body(axum::body::Body::from(body))?)
}

/// Convert a backend response, streaming its body.
fn relay_response(response: http::Response<hyper::body::Incoming>) -> Response {
    let (parts, incoming) = response.into_parts();

    let tokens = connection_tokens(
        parts
            .headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok()),
    );
    let mut headers = HeaderMap::with_capacity(parts.headers.len());
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str(), &tokens) {
            headers.append(name.clone(), value.clone());
        }
    }

    let stream = axum::body::Body::new(incoming)
        .into_data_stream()
        .map_err(io::Error::other);

    Response {
        status: parts.status,
        headers,
        body: Body::from_stream(stream),
    }
}

/// Forward a request along `route`.
///
/// Backend failures become 502/504 responses; a body that cannot be read
/// from the client is returned as an error for the connection handler.
pub async fn forward(
    client: &BackendClient,
    route: &ProxyRoute,
    environ: &mut Environ<'_>,
    timeout: Duration,
    max_body: u64,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let body = environ.input().read_to_end(max_body).await?;
    let request = build_request(route, environ, body)?;
    let uri = request.uri().to_string();

    tracing::debug!(
        method = %request.method(),
        backend = %uri,
        prefix = route.prefix(),
        "Proxying request"
    );

    let error = match tokio::time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => {
            tracing::debug!(
                backend = %uri,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Backend responded"
            );
            return Ok(relay_response(response));
        }
        Ok(Err(e)) => ProxyError::Upstream(e),
        Err(_) => ProxyError::Timeout(timeout),
    };

    tracing::warn!(backend = %uri, error = %error, "Upstream request failed");
    let status = match error {
        ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    Ok(Response::error_page(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRouteConfig;

    fn route(remove_prefix: bool) -> ProxyRoute {
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("X-Special".to_string(), "bar".to_string());
        ProxyRoute::from_config(&ProxyRouteConfig {
            prefix: "/bar".into(),
            target: "http://127.0.0.1:3000".into(),
            host: None,
            preserve_host: false,
            remove_prefix,
            headers,
        })
        .unwrap()
    }

    #[test]
    fn request_is_rewritten() {
        let environ = Environ::builder()
            .path("/bar/baz?a=a&b=b")
            .header("Host", "localhost")
            .header("Connection", "keep-alive, X-Drop")
            .header("X-Drop", "1")
            .header("X-Keep", "2")
            .build();
        let request = build_request(&route(true), &environ, bytes::Bytes::new()).unwrap();

        assert_eq!(request.uri(), "http://127.0.0.1:3000/baz?a=a&b=b");
        assert_eq!(request.headers()["host"], "127.0.0.1");
        assert_eq!(request.headers()["x-special"], "bar");
        assert_eq!(request.headers()["x-keep"], "2");
        assert!(request.headers().get("x-drop").is_none());
        assert!(request.headers().get("connection").is_none());
    }

    #[test]
    fn decoded_paths_are_reencoded() {
        let environ = Environ::builder().path("/bar/a b/c").build();
        let request = build_request(&route(false), &environ, bytes::Bytes::new()).unwrap();
        assert_eq!(request.uri().path(), "/bar/a%20b/c");
    }

    #[test]
    fn hop_by_hop_detection() {
        let tokens = connection_tokens(Some("Keep-Alive, X-Custom"));
        assert!(is_hop_by_hop("Transfer-Encoding", &tokens));
        assert!(is_hop_by_hop("x-custom", &tokens));
        assert!(!is_hop_by_hop("Content-Type", &tokens));
    }
}
