//! H1 reverse proxy.
//!
//! Requests matched to the legacy backend are proxied over HTTPS, with the
//! upstream hostname resolved through the configured mappings. Upstream
//! `Access-Control-*` headers are stripped: our own CORS handler is
//! authoritative. An upstream 500 with an empty body is almost certainly a
//! proxy error rather than an application response, so a canned body is
//! substituted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::config::ConfigSource;
use crate::http::buffer::BufferedBody;
use crate::http::server::AppState;
use crate::observability::metrics;

/// Error message sent to the client when proxying fails
const PROXY_ERROR_PAYLOAD: &[u8] = br#"{"status":false,"payload":"Internal low-level service failure, cannot complete request","debug":{"errorCode":"proxy error"},"code":11}"#;

/// Headers that must not be forwarded hop to hop.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The shared H1 upstream proxy.
pub struct H1Proxy {
    client: reqwest::Client,
    source: Arc<ConfigSource>,
}

impl H1Proxy {
    pub fn new(source: Arc<ConfigSource>, dial_timeout: Duration, response_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(response_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(5)
            .build()
            .expect("failed to build H1 proxy client");

        Self { client, source }
    }

    /// The upstream host for a request hostname: the configured proxy
    /// mapping, defaulting to `v1-<original-hostname>`.
    pub fn map_host(&self, hostname: &str) -> String {
        // strip port
        let hostname = match hostname.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => hostname,
        };
        let mappings = self.source.string_map_at(&["api", "proxyMappings"]);
        match mappings.get(hostname) {
            Some(mapped) if !mapped.is_empty() => mapped.clone(),
            _ => format!("v1-{hostname}"),
        }
    }

    /// Proxy one request upstream. `appended_city` is a city code resolved
    /// during feature extraction that must reach the upstream query string.
    pub async fn proxy(
        &self,
        req: Request<Body>,
        host: &str,
        appended_city: Option<&str>,
    ) -> Response<Body> {
        let upstream_host = self.map_host(host);
        let mut query = req.uri().query().unwrap_or("").to_string();
        if let Some(city) = appended_city {
            let pair = format!("city={city}");
            if query.is_empty() {
                query = pair;
            } else {
                query = format!("{query}&{pair}");
            }
        }

        let url = if query.is_empty() {
            format!("https://{}{}", upstream_host, req.uri().path())
        } else {
            format!("https://{}{}?{}", upstream_host, req.uri().path(), query)
        };
        tracing::trace!(url = %url, "Proxying request to H1");

        let body = req
            .extensions()
            .get::<BufferedBody>()
            .map(|b| b.0.clone())
            .unwrap_or_default();

        // Only the dial target is rewritten; the backend still sees the
        // client's original virtual-host identity
        let mut upstream = self
            .client
            .request(req.method().clone(), &url)
            .header(header::HOST, host)
            .body(body.to_vec());
        for (name, value) in req.headers() {
            let lower = name.as_str();
            if lower == "host" || lower == "content-length" || HOP_HEADERS.contains(&lower) {
                continue;
            }
            upstream = upstream.header(name, value);
        }

        let upstream_response = match upstream.send().await {
            Ok(rsp) => rsp,
            Err(e) => {
                tracing::error!(error = %e, url = %url, "H1 proxy request failed");
                // most likely a proxy error; all V1 services write a body
                return proxy_error_response();
            }
        };

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let bytes = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Error reading H1 response body");
                return proxy_error_response();
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR && bytes.is_empty() {
            return proxy_error_response();
        }

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

        // Add all headers that aren't CORS headers; our own CORS handler
        // decides those
        for (name, value) in &headers {
            let key = name.as_str();
            if key.starts_with("access-control-") {
                continue;
            }
            if HOP_HEADERS.contains(&key) || key == "content-length" {
                continue;
            }
            response.headers_mut().append(name, value.clone());
        }

        response
    }
}

fn proxy_error_response() -> Response<Body> {
    let mut response = Response::new(Body::from(PROXY_ERROR_PAYLOAD));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

/// Handle a rule-dispatched H1 request.
pub async fn handle(
    state: &AppState,
    req: Request<Body>,
    host: &str,
    appended_city: Option<&str>,
) -> Response<Body> {
    let start = Instant::now();
    let path = req.uri().path().to_string();

    let response = state.h1.proxy(req, host, appended_city).await;

    let success = !response.status().is_server_error();
    metrics::record_dispatch("h1", success, &state.config.health.az_name, start.elapsed());
    if path != "/" {
        state.stats.record("/", success, start.elapsed());
    }
    state.stats.record(&path, success, start.elapsed());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_with(mappings: &str) -> H1Proxy {
        let source = Arc::new(ConfigSource::new());
        source
            .load(format!(r#"{{"api":{{"proxyMappings":{mappings}}}}}"#).into_bytes())
            .unwrap();
        H1Proxy::new(source, Duration::from_secs(5), Duration::from_secs(30))
    }

    #[test]
    fn test_map_host_uses_configured_mapping() {
        let proxy = proxy_with(r#"{"api.example.com":"legacy.example.com"}"#);
        assert_eq!(proxy.map_host("api.example.com"), "legacy.example.com");
        assert_eq!(proxy.map_host("api.example.com:8080"), "legacy.example.com");
    }

    #[test]
    fn test_map_host_default_prefix() {
        let proxy = proxy_with("{}");
        assert_eq!(proxy.map_host("api.example.com"), "v1-api.example.com");
    }
}
