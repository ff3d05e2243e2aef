//! Request trace opt-in.
//!
//! A trace starts at our borders when the client asks for one (`X-H-TRACE: 1`
//! or an explicit `X-H-TRACEID`), or by configured percentage chance. The
//! trace ID rides outbound RPC calls and is echoed on the response.

use axum::http::{HeaderMap, HeaderValue};

use crate::config::ConfigSource;

const TRACE_ID_HEADER: &str = "X-H-TRACEID";
const TRACE_FLAG_HEADER: &str = "X-H-TRACE";

/// Tracing decision for one request. A blank `trace_id` means tracing is not
/// enabled.
#[derive(Debug, Clone, Default)]
pub struct TraceInfo {
    pub trace_id: String,
    pub persistent: bool,
}

/// Decide if we should trace a request.
pub fn start(headers: &HeaderMap, source: &ConfigSource) -> TraceInfo {
    let mut trace_id = headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let user_initiated = !trace_id.is_empty()
        || headers
            .get(TRACE_FLAG_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("1");

    if (user_initiated || random_trace(source)) && trace_id.is_empty() {
        trace_id = uuid::Uuid::new_v4().to_string();
    }

    TraceInfo {
        trace_id,
        persistent: user_initiated,
    }
}

/// Attach trace details to the response.
pub fn write(headers: &mut HeaderMap, info: &TraceInfo) {
    if info.trace_id.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&info.trace_id) {
        headers.insert(TRACE_ID_HEADER, value);
    }
}

/// Determines, using the configured pcChance (0.0 -> 1.0), whether to
/// initiate a trace for a request.
fn random_trace(source: &ConfigSource) -> bool {
    let pc_chance = source.f64_at(&["hailo", "api", "trace", "pcChance"], 0.0);
    pc_chance > 0.0 && rand::random::<f64>() < pc_chance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_trace_id_is_kept() {
        let source = ConfigSource::new();
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("trace-123"));

        let info = start(&headers, &source);
        assert_eq!(info.trace_id, "trace-123");
        assert!(info.persistent);
    }

    #[test]
    fn test_trace_flag_mints_an_id() {
        let source = ConfigSource::new();
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_FLAG_HEADER, HeaderValue::from_static("1"));

        let info = start(&headers, &source);
        assert!(!info.trace_id.is_empty());
        assert!(info.persistent);
    }

    #[test]
    fn test_no_opt_in_no_trace() {
        let source = ConfigSource::new();
        let info = start(&HeaderMap::new(), &source);
        assert!(info.trace_id.is_empty());
        assert!(!info.persistent);

        let mut headers = HeaderMap::new();
        write(&mut headers, &info);
        assert!(headers.get(TRACE_ID_HEADER).is_none());
    }

    #[test]
    fn test_write_echoes_id() {
        let info = TraceInfo {
            trace_id: "trace-123".to_string(),
            persistent: true,
        };
        let mut headers = HeaderMap::new();
        write(&mut headers, &info);
        assert_eq!(headers.get(TRACE_ID_HEADER).unwrap(), "trace-123");
    }
}
