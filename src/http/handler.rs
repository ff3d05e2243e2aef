//! The default handler: rule-based dispatch.
//!
//! Asks the control plane for a router bound to the incoming request,
//! selects a rule, and dispatches by action. Every response may additionally
//! carry region-pinning headers and the HOB mode.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::control::extractor::{Extractor, Features};
use crate::control::regions::Urls;
use crate::control::router::RuleRouter;
use crate::control::rules::{Action, Payload, Rule};
use crate::http::buffer::BufferedBody;
use crate::http::server::AppState;
use crate::http::{h1, h2};
use crate::observability::metrics;
use crate::trace;

const THROTTLE_PAYLOAD: &[u8] = br#"{"status":false,"payload":"Throttled request","code":11}"#;
const DEPRECATE_PAYLOAD: &[u8] = br#"{"status":false,"payload":"Deprecated","code":11}"#;

/// Build a feature extractor over a buffered request.
pub fn extractor_for(req: &Request<Body>) -> Extractor {
    let body = req
        .extensions()
        .get::<BufferedBody>()
        .map(|b| b.0.clone())
        .unwrap_or_else(Bytes::new);
    Extractor::new(
        req.method().clone(),
        req.uri().clone(),
        req.headers().clone(),
        body,
    )
}

/// Handle an HTTP request, deciding what to do with it.
pub async fn dispatch_handler(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    let trace_info = trace::start(req.headers(), &state.source);
    let mut router = state.control.router(extractor_for(&req));
    let route = router.route();

    // decorations decided before dispatch, merged into whatever response the
    // action produces
    let mut decorations = HeaderMap::new();
    maybe_pin_request_to_hostname(&mut router, &mut decorations);

    let hob_mode = router.hob_mode();
    if !hob_mode.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&hob_mode) {
            decorations.insert("X-H-Mode", value);
        }
    }

    let rule = match route {
        Some(rule) => rule,
        None => {
            tracing::trace!("No route available; defaulting to H2");
            Rule::for_action(Action::SendToH2)
        }
    };

    if let Ok(value) = HeaderValue::from_str(rule.action.as_str()) {
        decorations.insert("X-Hailo-Route", value);
    }

    let mut response = match rule.action {
        Action::ProxyToH1 => {
            tracing::trace!("Matched H1 proxy route");
            let host = router.extractor().host();
            let appended = router.extractor().appended_city().map(str::to_string);
            h1::handle(&state, req, &host, appended.as_deref()).await
        }
        Action::Throttle => {
            tracing::trace!("Matched throttle route");
            metrics::record_throttled();
            payload_response(rule.payload.as_ref(), StatusCode::SERVICE_UNAVAILABLE, THROTTLE_PAYLOAD)
        }
        Action::Deprecate => {
            tracing::trace!("Matched deprecate route");
            metrics::record_deprecated();
            payload_response(rule.payload.as_ref(), StatusCode::GONE, DEPRECATE_PAYLOAD)
        }
        Action::SendToH2 => {
            tracing::trace!("Matched H2 route");
            h2::handle(&state, req, &mut router, &trace_info).await
        }
    };

    for (name, value) in decorations.iter() {
        response.headers_mut().insert(name, value.clone());
    }
    trace::write(response.headers_mut(), &trace_info);

    response
}

/// Shed traffic with the rule's payload, or the standard response when the
/// rule carries none.
fn payload_response(
    payload: Option<&Payload>,
    default_status: StatusCode,
    default_body: &'static [u8],
) -> Response<Body> {
    match payload {
        None => {
            let mut response = Response::new(Body::from(default_body));
            *response.status_mut() = default_status;
            response
        }
        Some(payload) => {
            let status = StatusCode::from_u16(payload.http_status).unwrap_or(default_status);
            let mut builder = Response::builder().status(status);
            for (k, v) in &payload.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            builder
                .body(Body::from(payload.body.clone()))
                .unwrap_or_else(|_| default_status.into_response())
        }
    }
}

/// Determine whether the request should be pinned to a different hostname
/// (with the X-H-ENDPOINT-* headers), adding them if necessary.
fn maybe_pin_request_to_hostname(router: &mut RuleRouter, headers: &mut HeaderMap) {
    match router.correct_hostname(None) {
        Ok(check) if !check.is_correct => pin_request_to_hostname(headers, check.version, &check.urls),
        Ok(_) => {}
        Err(e) => tracing::debug!(reason = %e, "Skipping region pinning"),
    }
}

/// Send the X-H-ENDPOINT-* headers.
fn pin_request_to_hostname(headers: &mut HeaderMap, version: i64, urls: &Urls) {
    if let Ok(value) = HeaderValue::from_str(&version.to_string()) {
        headers.insert("X-H-ENDPOINT-TIMESTAMP", value);
    }
    for (purpose, url) in urls {
        let name = format!("X-H-ENDPOINT-{}", purpose.to_uppercase().replace('_', "-"));
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(url),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Re-check pinning after a backend response: the backend may have resolved
/// the HOB for us (X-H-Hob) and asked for pinning (X-H-Pinning: 1).
pub fn region_pinning(router: &mut RuleRouter, headers: &mut HeaderMap) {
    let hob = headers
        .get("X-H-Hob")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // already pinned and the backend had nothing to add
    if hob.is_empty() && headers.contains_key("X-H-Endpoint-Timestamp") {
        return;
    }

    let pinning_requested = headers
        .get("X-H-Pinning")
        .and_then(|v| v.to_str().ok())
        == Some("1");

    if !hob.is_empty() && pinning_requested {
        router.set_hob(&hob);
        if let Ok(check) = router.correct_hostname(None) {
            pin_request_to_hostname(headers, check.version, &check.urls);
        }
    }
}

/// `/version` response.
pub async fn version_handler() -> Response<Body> {
    let body = format!(r#"{{"version":"{}"}}"#, env!("CARGO_PKG_VERSION"));
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `/favicon.ico` response: a fixed tiny PNG.
pub async fn favicon_handler() -> Response<Body> {
    const FAVICON: [u8; 84] = [
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
        0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10,
        0x01, 0x03, 0x00, 0x00, 0x00, 0x25, 0x3d, 0x6d, 0x22, 0x00, 0x00, 0x00,
        0x03, 0x50, 0x4c, 0x54, 0x45, 0xfd, 0xbd, 0x2c, 0x79, 0xd5, 0x61, 0x4f,
        0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x08, 0x99, 0x63, 0x60,
        0x20, 0x0d, 0x00, 0x00, 0x00, 0x30, 0x00, 0x01, 0x43, 0x94, 0xb7, 0x67,
        0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
    ];
    ([(header::CONTENT_TYPE, "image/png")], FAVICON.to_vec()).into_response()
}
