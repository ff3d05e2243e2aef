//! CORS decoration.
//!
//! The origin allow-list is fixed: this proxy fronts a known set of web
//! properties. This handler is authoritative for `Access-Control-*` headers;
//! anything an upstream sends is stripped before we get here (see `h1`).

use std::sync::LazyLock;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use regex::Regex;

static ALLOWED_ORIGINS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^https?://(?:[-\w\.]+\.)?hailoweb.com(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?hailoapp.com(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?hailovpn.com(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?elasticride.com(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?elasticride.local(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?elasticride.dev(:\d+)?$",
        r"^https?://(?:[-\w\.]+\.)?hailopay.com(:\d+)?$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid CORS origin pattern"))
    .collect()
});

const ALLOWED_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, POST, PUT";

fn is_allowed_origin(origin: &str) -> bool {
    ALLOWED_ORIGINS.iter().any(|re| re.is_match(origin))
}

pub async fn cors_middleware(req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if origin.is_empty() || !is_allowed_origin(&origin) {
        return next.run(req).await;
    }

    let requested_headers = req
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();

    // Preflight requests are answered here, with the security policy cached
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        decorate(response.headers_mut(), &origin, requested_headers);
        response.headers_mut().insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("3600"),
        );
        return response;
    }

    let mut response = next.run(req).await;
    decorate(response.headers_mut(), &origin, requested_headers);
    response
}

fn decorate(
    headers: &mut axum::http::HeaderMap,
    origin: &str,
    requested_headers: Option<HeaderValue>,
) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    // Allow all headers the client wants to send
    if let Some(wanted) = requested_headers {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, wanted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allow_list() {
        assert!(is_allowed_origin("https://www.elasticride.com"));
        assert!(is_allowed_origin("http://sub.domain.hailoapp.com:8080"));
        assert!(is_allowed_origin("https://hailoweb.com"));
        assert!(!is_allowed_origin("https://evil.example.com"));
        assert!(!is_allowed_origin("https://elasticride.com.evil.example"));
    }
}
