//! Request body buffering.
//!
//! Feature extraction and backend marshalling both need the request
//! parameters, and downstream handlers still need an intact body. The whole
//! body is read once here; readers get a shared byte slice and the request
//! continues with an equivalent re-read body.

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Upper bound on buffered request bodies.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// The fully-read request body, shared through request extensions.
#[derive(Debug, Clone, Default)]
pub struct BufferedBody(pub Bytes);

pub async fn buffer_body_middleware(req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "Unable to read request body").into_response();
        }
    };

    parts.extensions.insert(BufferedBody(bytes.clone()));
    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}
