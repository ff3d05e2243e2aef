//! `/endpoints`: serves app-pinning configuration to apps.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use crate::http::handler::extractor_for;
use crate::http::server::AppState;

pub async fn endpoints_handler(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    let query: std::collections::HashMap<String, String> =
        url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

    let mut router = state.control.router(extractor_for(&req));
    let (region, version) = router.region();

    let Some(region) = region else {
        return error_body(
            &state,
            "noregions",
            "No online regions found",
        );
    };

    let app_id = query.get("app").map(String::as_str).unwrap_or("");
    let Some(urls) = region.urls(app_id) else {
        return error_body(&state, "noapps", "No apps found for this region");
    };

    // construct response
    let mut endpoints = serde_json::Map::new();
    endpoints.insert("timestamp".to_string(), json!(version));
    for (k, v) in urls {
        endpoints.insert(k.replace('_', "-"), json!(v));
    }

    let mut rsp = json!({
        "status": true,
        "payload": "OK",
        "endpoints": endpoints,
    });

    // If verbose requested, return enhanced config so clients can cache
    // multiple hobs
    let verbose = query
        .get("verbose")
        .map(|v| matches!(v.as_str(), "true" | "1" | "t" | "T" | "TRUE" | "True"))
        .unwrap_or(false);
    if verbose {
        rsp["regions"] = serde_json::to_value(state.control.regions()).unwrap_or_default();
        rsp["hobRegions"] = serde_json::to_value(state.control.hob_regions()).unwrap_or_default();
    }

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        rsp.to_string(),
    )
        .into_response()
}

fn error_body(state: &AppState, code: &str, payload: &str) -> Response<Body> {
    let body = json!({
        "status": false,
        "code": 11,
        "dotted_code": format!("{}.{}", state.config.service.name, code),
        "payload": payload,
    });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}
