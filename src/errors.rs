//! API error taxonomy and wire representation.
//!
//! # Responsibilities
//! - Carry kind, dotted code, human description, and context for every error
//! - Render the standard JSON error body
//! - Sanitise descriptions when configured, so the wire doesn't leak internals

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Error classes surfaced by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    MethodNotAllowed,
    Forbidden,
    NotFound,
    Throttled,
    Deprecated,
    Internal,
}

impl ErrorKind {
    /// Stable name used when sanitising the description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Throttled => "THROTTLED",
            ErrorKind::Deprecated => "DEPRECATED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    fn http_code(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Deprecated => StatusCode::GONE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Legacy numeric code clients still switch on.
    fn legacy_number(&self) -> i64 {
        match self {
            ErrorKind::BadRequest | ErrorKind::MethodNotAllowed => 15,
            ErrorKind::Forbidden => 5,
            ErrorKind::Throttled => 429,
            _ => 11,
        }
    }
}

/// The standard JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: bool,
    pub payload: String,
    pub code: i64,
    pub dotted_code: String,
    pub context: Option<Vec<String>>,
}

/// An error carrying everything needed to answer an HTTP request.
#[derive(Debug, Clone)]
pub struct ApiError {
    kind: ErrorKind,
    dotted_code: String,
    description: String,
    context: Vec<String>,
    http_code: StatusCode,
    number: i64,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, dotted_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            dotted_code: dotted_code.into(),
            description: description.into(),
            context: Vec::new(),
            http_code: kind.http_code(),
            number: kind.legacy_number(),
            headers: Vec::new(),
        }
    }

    pub fn bad_request(dotted_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, dotted_code, description)
    }

    pub fn forbidden(dotted_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, dotted_code, description)
    }

    pub fn not_found(dotted_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, dotted_code, description)
    }

    pub fn internal(dotted_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, dotted_code, description)
    }

    /// 405 for a non-POST hit on the RPC bridge, with the required Allow header.
    pub fn post_required(dotted_code: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::MethodNotAllowed,
            dotted_code,
            "Requests to the RPC endpoint must be POST-ed",
        )
        .with_header(header::ALLOW, HeaderValue::from_static("POST"))
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Override the HTTP status (e.g. a deprecate rule with a custom payload).
    pub fn with_http_code(mut self, code: StatusCode) -> Self {
        self.http_code = code;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn dotted_code(&self) -> &str {
        &self.dotted_code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn http_code(&self) -> StatusCode {
        self.http_code
    }

    /// Render the error as an HTTP response.
    ///
    /// When `sanitise` is set the description is replaced by the error kind.
    pub fn respond(&self, sanitise: bool) -> Response<Body> {
        let payload = if sanitise {
            self.kind.as_str().to_string()
        } else if self.description.is_empty() {
            "Internal low-level service failure, cannot complete request".to_string()
        } else {
            self.description.clone()
        };

        let body = ErrorBody {
            status: false,
            payload,
            code: self.number,
            dotted_code: self.dotted_code.clone(),
            context: if self.context.is_empty() {
                None
            } else {
                Some(self.context.clone())
            },
        };

        let bytes = serde_json::to_vec(&body).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Error marshaling the error response into JSON");
            Vec::new()
        });

        let mut builder = Response::builder()
            .status(self.http_code)
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.dotted_code, self.description)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body_shape() {
        let err = ApiError::bad_request("api.rpc.missingservice", "Missing 'service' parameter.");
        let rsp = err.respond(false);
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            rsp.headers().get(header::CONTENT_TYPE).unwrap(),
            JSON_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_sanitise_replaces_description() {
        let err = ApiError::internal("api.boom", "connection refused to 10.0.0.1:5672");

        let rsp = err.respond(true);
        let bytes = axum::body::to_bytes(rsp.into_body(), 4096).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.payload, "INTERNAL");
        assert_eq!(body.dotted_code, "api.boom");

        let rsp = err.respond(false);
        let bytes = axum::body::to_bytes(rsp.into_body(), 4096).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert!(body.payload.contains("10.0.0.1"));
    }

    #[test]
    fn test_post_required_carries_allow_header() {
        let err = ApiError::post_required("api.rpc.postrequired");
        let rsp = err.respond(false);
        assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(rsp.headers().get(header::ALLOW).unwrap(), "POST");
    }
}
