//! The RPC bridge: `/rpc` and `/v2/h2/call`.
//!
//! Clients name the service and endpoint explicitly instead of relying on
//! path inference. Requests must be POST-ed, either as a form carrying a
//! JSON `request` parameter, or as raw protobuf bytes with the service and
//! endpoint in the query string.

use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, Response, StatusCode};
use axum::response::IntoResponse;

use crate::errors::ApiError;
use crate::http::buffer::BufferedBody;
use crate::http::h2::{self, RequestEnvelope, DEFAULT_RESPONSE_MIME, PROTO_MIME};
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::trace;

/// Verifies whether a session is allowed to call privileged services.
#[async_trait]
pub trait AdminVerifier: Send + Sync {
    async fn is_admin(&self, session_id: &str) -> bool;
}

/// Default verifier with no auth service wired: denies everything.
pub struct DenyAllVerifier;

#[async_trait]
impl AdminVerifier for DenyAllVerifier {
    async fn is_admin(&self, _session_id: &str) -> bool {
        false
    }
}

/// Handle an inbound HTTP request for H2 RPC.
pub async fn rpc_handler(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    let path = req.uri().path().to_string();
    let trace_info = trace::start(req.headers(), &state.source);

    let mut response = match rpc_call(&state, req, &trace_info).await {
        Ok(response) => response,
        Err(e) => {
            record(&state, &path, false, start);
            let mut response = e.respond(state.sanitise_errors());
            trace::write(response.headers_mut(), &trace_info);
            return response;
        }
    };

    record(&state, &path, true, start);
    trace::write(response.headers_mut(), &trace_info);
    response
}

fn record(state: &AppState, path: &str, success: bool, start: Instant) {
    metrics::record_dispatch("h2", success, &state.config.health.az_name, start.elapsed());
    if path != "/" {
        state.stats.record("/", success, start.elapsed());
    }
    state.stats.record(path, success, start.elapsed());
}

async fn rpc_call(
    state: &AppState,
    req: Request<Body>,
    trace_info: &trace::TraceInfo,
) -> Result<Response<Body>, ApiError> {
    // sanity check basics: requests must be POST-ed
    if req.method() != Method::POST {
        return Err(ApiError::post_required("api.rpc.postrequired").with_context("15"));
    }

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_proto = content_type == PROTO_MIME;

    // decide how to respond
    let response_content_type = if is_proto { PROTO_MIME } else { DEFAULT_RESPONSE_MIME };

    let body = req
        .extensions()
        .get::<BufferedBody>()
        .map(|b| b.0.clone())
        .unwrap_or_default();

    let (service, endpoint, request_body) = if is_proto {
        // raw bytes; service and endpoint named in the query
        let query = query_map(&req);
        (
            query.get("service").cloned().unwrap_or_default(),
            query.get("endpoint").cloned().unwrap_or_default(),
            String::from_utf8_lossy(&body).into_owned(),
        )
    } else {
        // assume JSON is posted as a form param
        let form: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(&body)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
        let request = match form.get("request") {
            Some(r) if !r.is_empty() => r.clone(),
            _ => "{}".to_string(),
        };
        (
            form.get("service").cloned().unwrap_or_default(),
            form.get("endpoint").cloned().unwrap_or_default(),
            request,
        )
    };

    if service.is_empty() {
        return Err(ApiError::bad_request(
            "api.rpc.missingservice",
            "Missing 'service' parameter.",
        )
        .with_context("15"));
    }
    if endpoint.is_empty() {
        return Err(ApiError::bad_request(
            "api.rpc.missingendpoint",
            "Missing 'endpoint' parameter.",
        )
        .with_context("15"));
    }

    let session_id = super::server::session_id_for(&req);
    authorised_for(state, &session_id, &service).await?;

    let mut envelope = RequestEnvelope {
        service,
        endpoint,
        path: req.uri().path().to_string(),
        verb: req.method().to_string(),
        body: request_body,
        ..Default::default()
    };
    h2::scope_envelope(&mut envelope, state, &req, trace_info);

    let rsp = state.rpc.call(envelope).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(response_content_type))],
        rsp.body,
    )
        .into_response())
}

/// Blanket block on the privileged namespace: only sessions holding ADMIN
/// may call it.
async fn authorised_for(
    state: &AppState,
    session_id: &str,
    service: &str,
) -> Result<(), ApiError> {
    if !service.starts_with(&state.config.service.privileged_prefix) {
        return Ok(());
    }

    if !session_id.is_empty() && state.admin.is_admin(session_id).await {
        return Ok(());
    }

    Err(ApiError::forbidden("api.rpc.auth", "Permission denied.").with_context("5"))
}

fn query_map(req: &Request<Body>) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
