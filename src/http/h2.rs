//! H2 dispatch: translate the HTTP request into an RPC call to an API-tier
//! service, inferred from the path, and map the RPC response back.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, Method, Response, StatusCode};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::control::router::RuleRouter;
use crate::errors::ApiError;
use crate::http::buffer::BufferedBody;
use crate::http::handler::region_pinning;
use crate::http::realip::ClientAddr;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::trace::TraceInfo;

pub const PROTO_MIME: &str = "application/x-protobuf";
pub const FORM_ENCODED_MIME: &str = "application/x-www-form-urlencoded";
pub const DEFAULT_RESPONSE_MIME: &str = "application/json; charset=utf-8";

/// An HTTP request translated for the RPC transport.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestEnvelope {
    pub service: String,
    pub endpoint: String,
    pub path: String,
    pub verb: String,
    /// Query parameters (minus session credentials).
    pub get: BTreeMap<String, String>,
    /// Body parameters (minus session credentials).
    pub post: BTreeMap<String, String>,
    /// Raw body, carried when the request wasn't form-encoded.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Pass-through headers as "Key: value" strings.
    pub header: Vec<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(rename = "traceId", skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(rename = "tracePersist")]
    pub trace_persist: bool,
    pub from: String,
    #[serde(rename = "remoteAddr", skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
}

/// The RPC transport's response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    /// Response headers as "Key: Value" strings.
    #[serde(default)]
    pub header: Vec<String>,
}

/// The RPC transport to the H2 platform.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, envelope: RequestEnvelope) -> Result<RpcResponse, ApiError>;
}

/// HTTP implementation of the RPC transport.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRpcClient {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, envelope: RequestEnvelope) -> Result<RpcResponse, ApiError> {
        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| ApiError::internal("api.rpc.transport", e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::internal(
                "api.rpc.transport",
                format!("RPC transport returned status {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::internal("api.rpc.unmarshal", e.to_string()))
    }
}

/// Handle a rule-dispatched H2 request: map request to envelope, dispatch,
/// map the response back, and re-check region pinning.
pub async fn handle(
    state: &AppState,
    req: Request<Body>,
    router: &mut RuleRouter,
    trace_info: &TraceInfo,
) -> Response<Body> {
    let start = Instant::now();
    let path = req.uri().path().to_string();

    let mut envelope = match request_to_envelope(&req) {
        Ok(envelope) => envelope,
        Err(e) => {
            record(state, &path, false, start);
            return e.respond(state.sanitise_errors());
        }
    };

    let (service, endpoint) = path_to_endpoint(&path, &state.config.service.rpc_prefix);
    envelope.service = service;
    envelope.endpoint = endpoint;
    scope_envelope(&mut envelope, state, &req, trace_info);

    let rsp = match state.rpc.call(envelope).await {
        Ok(rsp) => rsp,
        Err(e) => {
            record(state, &path, false, start);
            return e.respond(state.sanitise_errors());
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::from_u16(rsp.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .body(Body::from(rsp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    apply_response_headers(response.headers_mut(), &rsp.header);

    // default to json if no content-type set
    if !response.headers().contains_key(header::CONTENT_TYPE) {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(DEFAULT_RESPONSE_MIME),
        );
    }

    // Check if we need to set the region pinning headers
    region_pinning(router, response.headers_mut());

    let success = rsp.status_code < 500;
    record(state, &path, success, start);

    response
}

fn record(state: &AppState, path: &str, success: bool, start: Instant) {
    metrics::record_dispatch("h2", success, &state.config.health.az_name, start.elapsed());
    if path != "/" {
        state.stats.record("/", success, start.elapsed());
    }
    state.stats.record(path, success, start.elapsed());
}

/// Attach session, trace and caller scope to an envelope.
pub fn scope_envelope(
    envelope: &mut RequestEnvelope,
    state: &AppState,
    req: &Request<Body>,
    trace_info: &TraceInfo,
) {
    if !trace_info.trace_id.is_empty() {
        envelope.trace_id = trace_info.trace_id.clone();
        envelope.trace_persist = trace_info.persistent;
    }
    envelope.session_id = super::server::session_id_for(req);
    envelope.from = state.config.service.name.clone();
    if let Some(ClientAddr(addr)) = req.extensions().get::<ClientAddr>() {
        envelope.remote_addr = addr.clone();
    }
}

/// Response headers arrive as "Key: Value" strings; malformed entries are
/// dropped with a warning.
pub fn apply_response_headers(headers: &mut axum::http::HeaderMap, raw: &[String]) {
    for entry in raw {
        let mut parts = entry.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) => {
                let key = key.trim();
                let value = value.trim();
                match (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.append(name, value);
                    }
                    _ => tracing::warn!(header = %entry, "Malformed header"),
                }
            }
            _ => tracing::warn!(header = %entry, "Malformed header"),
        }
    }
}

/// Map an HTTP request into an RPC envelope: parameters from query and body,
/// session credentials stripped, the HOB re-attached under `hob`, and custom
/// headers passed through.
pub fn request_to_envelope(req: &Request<Body>) -> Result<RequestEnvelope, ApiError> {
    let mut envelope = RequestEnvelope {
        path: req.uri().path().to_string(),
        verb: req.method().to_string(),
        ..Default::default()
    };

    let body = req
        .extensions()
        .get::<BufferedBody>()
        .map(|b| b.0.clone())
        .unwrap_or_default();

    // Not all clients send the correct mime type; POST and PUT default to
    // form-encoded when it is missing or unparseable
    let raw_ct = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let body_method = *req.method() == Method::POST
        || *req.method() == Method::PUT
        || *req.method() == Method::PATCH;
    let form_encoded = body_method
        && match raw_ct.parse::<mime::Mime>() {
            Ok(ct) => ct.type_() == mime::APPLICATION && ct.subtype() == "x-www-form-urlencoded",
            Err(_) => req.method() == Method::POST || req.method() == Method::PUT,
        };

    if !body.is_empty() && !form_encoded {
        envelope.body = String::from_utf8_lossy(&body).into_owned();
    }

    let mut hob_code = String::new();

    let mut collect = |pairs: url::form_urlencoded::Parse<'_>, out: &mut BTreeMap<String, String>| {
        for (k, v) in pairs {
            let k = k.into_owned();
            let v = v.into_owned();
            match k.as_str() {
                "session_id" | "api_token" => continue,
                "hob" => {
                    hob_code = v;
                    continue;
                }
                "city" => {
                    if v.len() == 3 && hob_code.len() != 3 {
                        hob_code = v.clone();
                    }
                }
                _ => {}
            }
            out.entry(k).or_insert(v);
        }
    };

    let mut get = BTreeMap::new();
    collect(
        url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes()),
        &mut get,
    );

    let mut post = BTreeMap::new();
    if form_encoded && !body.is_empty() {
        collect(url::form_urlencoded::parse(&body), &mut post);
    }

    // need to add the HOB back in
    if hob_code.len() == 3 {
        get.insert("hob".to_string(), hob_code.clone());
        post.insert("hob".to_string(), hob_code.clone());
    }
    metrics::record_hob(&hob_code);

    envelope.get = get;
    envelope.post = post;

    // only pass through custom headers
    for (name, value) in req.headers() {
        let canonical = name.as_str();
        if canonical.eq_ignore_ascii_case("authorization") || canonical.starts_with("x-") {
            if let Ok(v) = value.to_str() {
                envelope.header.push(format!("{}: {}", name, v));
            }
        }
    }

    Ok(envelope)
}

/// Infer the service and endpoint names from a request path.
pub fn path_to_endpoint(path: &str, prefix: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();
    let (head, tail) = parts.split_at(parts.len() - 1);
    (format!("{prefix}{}", head.join(".")), tail[0].to_string())
}
