//! Request feature extraction.
//!
//! # Responsibilities
//! - Expose a read-only view of request features to the matcher and router
//! - Compute each feature at most once per request, lazily
//! - Leave the original request body intact for downstream handlers
//!
//! # Design Decisions
//! - One extractor belongs to one request; it is not thread safe
//! - The body is pre-buffered by the server (see `http::buffer`), so
//!   extraction reads a shared byte slice and never consumes the stream

use std::collections::HashMap;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, Uri};

use crate::control::hostmap;
use crate::session;

/// Key added by a client (to the query or body parameters) to specify a city
const CITY_CODE_KEY: &str = "city";
const HOB_CODE_KEY: &str = "hob";

const FORM_ENCODED_MIME: &str = "application/x-www-form-urlencoded";

/// What the matcher and router can ask about a request.
///
/// Lookups may mutate internal caches, hence `&mut self` throughout.
pub trait Features {
    /// The city code for this request.
    fn hob(&mut self) -> String;
    /// Some POST or GET value.
    fn value(&mut self, name: &str) -> String;
    /// The pathname of the request.
    fn path(&self) -> String;
    /// Whether this came from the "customer" or "driver" API.
    fn source(&mut self) -> String;
    /// Host of the request.
    fn host(&self) -> String;
    /// Some HTTP header.
    fn header(&self, name: &str) -> String;
    /// Write the hob back onto the request parameters.
    fn set_hob(&mut self, code: &str);
}

/// Wraps the interesting parts of an HTTP request and extracts vars from
/// them lazily.
pub struct Extractor {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    /// Extracted values from query and body (a parameter found in BOTH takes
    /// the value from the body).
    values: Option<HashMap<String, String>>,
    /// City code written back by `set_hob`, to be re-attached to the query
    /// when the request is forwarded upstream.
    appended_city: Option<String>,
}

impl Extractor {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            values: None,
            appended_city: None,
        }
    }

    /// City code written back during extraction, if any. The H1 proxy
    /// re-attaches this to the upstream query string.
    pub fn appended_city(&self) -> Option<&str> {
        self.appended_city.as_deref()
    }

    fn city_or_hob(&mut self) -> String {
        let city = self.value(CITY_CODE_KEY);
        if !city.is_empty() {
            return city;
        }
        self.value(HOB_CODE_KEY)
    }

    /// Invoked lazily when a value is first needed.
    fn do_extraction(&mut self) {
        let mut query_values: HashMap<String, String> = HashMap::new();
        for (k, v) in url::form_urlencoded::parse(self.uri.query().unwrap_or("").as_bytes()) {
            // first occurrence wins, like picking vs[0]
            query_values.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }

        let mut body_values: HashMap<String, String> = HashMap::new();
        if !self.body.is_empty() && self.body_is_form_encoded() {
            for (k, v) in url::form_urlencoded::parse(&self.body) {
                body_values.entry(k.into_owned()).or_insert_with(|| v.into_owned());
            }
        }

        // session_id extracted in the same way we extract when we decide what
        // to use for auth, and overrides everything else
        let session_id = session::session_id(&query_values, &body_values, &self.headers);

        let mut values = query_values;
        values.extend(body_values);
        values.insert("session_id".to_string(), session_id);

        if let Some(city) = &self.appended_city {
            values.insert(CITY_CODE_KEY.to_string(), city.clone());
        }

        self.values = Some(values);
    }

    /// Not all clients send the correct mime type: a POST or PUT with a
    /// missing or unparseable Content-Type is treated as form-encoded.
    /// Bodies of other methods never contribute parameters.
    fn body_is_form_encoded(&self) -> bool {
        let body_method = self.method == Method::POST
            || self.method == Method::PUT
            || self.method == Method::PATCH;
        if !body_method {
            return false;
        }

        let raw = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        match raw.parse::<mime::Mime>() {
            Ok(ct) => {
                ct.type_() == mime::APPLICATION && ct.subtype() == "x-www-form-urlencoded"
            }
            Err(_) => self.method == Method::POST || self.method == Method::PUT,
        }
    }
}

impl Features for Extractor {
    /// Extracts a city code from the request, looking at either an explicit
    /// query/body parameter or a hostname match against a known list.
    fn hob(&mut self) -> String {
        let hob = self.city_or_hob();
        if !hob.is_empty() {
            return hob;
        }

        if let Some(code) = hostmap::lookup(&self.host()) {
            tracing::trace!(code, host = %self.host(), "HOB match from HTTP Host header");
            self.set_hob(code);
            return code.to_string();
        }

        tracing::trace!("Unable to detect hob from request");
        String::new()
    }

    fn value(&mut self, name: &str) -> String {
        if self.values.is_none() {
            self.do_extraction();
        }
        self.values
            .as_ref()
            .and_then(|v| v.get(name).cloned())
            .unwrap_or_default()
    }

    fn path(&self) -> String {
        self.uri.path().to_string()
    }

    fn source(&mut self) -> String {
        let host = self.host();
        if host.contains("driver") {
            return "driver".to_string();
        }
        if host.contains("customer") {
            return "customer".to_string();
        }
        self.header("X-H-Source")
    }

    fn host(&self) -> String {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }

    fn header(&self, name: &str) -> String {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn set_hob(&mut self, code: &str) {
        self.appended_city = Some(code.to_string());
        if self.values.is_none() {
            self.do_extraction();
        } else if let Some(values) = &mut self.values {
            values.insert(CITY_CODE_KEY.to_string(), code.to_string());
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Features;
    use std::collections::HashMap;

    /// A canned feature set for matcher and router tests.
    #[derive(Default)]
    pub struct FakeFeatures {
        pub hob: String,
        pub source: String,
        pub path: String,
        pub host: String,
        pub headers: HashMap<String, String>,
        pub values: HashMap<String, String>,
    }

    impl FakeFeatures {
        pub fn new(hob: &str, source: &str, path: &str) -> Self {
            Self {
                hob: hob.to_string(),
                source: source.to_string(),
                path: path.to_string(),
                ..Default::default()
            }
        }
    }

    impl Features for FakeFeatures {
        fn hob(&mut self) -> String {
            self.hob.clone()
        }

        fn value(&mut self, name: &str) -> String {
            self.values.get(name).cloned().unwrap_or_default()
        }

        fn path(&self) -> String {
            self.path.clone()
        }

        fn source(&mut self) -> String {
            self.source.clone()
        }

        fn host(&self) -> String {
            self.host.clone()
        }

        fn header(&self, name: &str) -> String {
            self.headers.get(name).cloned().unwrap_or_default()
        }

        fn set_hob(&mut self, code: &str) {
            self.hob = code.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn extractor(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Extractor {
        let mut header_map = HeaderMap::new();
        for (k, v) in headers {
            header_map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        Extractor::new(
            method,
            uri.parse().unwrap(),
            header_map,
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    #[test]
    fn test_explicit_city_wins() {
        let mut e = extractor(Method::GET, "/v1/foo?city=LON&hob=NYC", &[], "");
        assert_eq!(e.hob(), "LON");
    }

    #[test]
    fn test_hob_param_when_no_city() {
        let mut e = extractor(Method::GET, "/v1/foo?hob=NYC", &[], "");
        assert_eq!(e.hob(), "NYC");
    }

    #[test]
    fn test_hob_from_host_table_writes_back_city() {
        let mut e = extractor(
            Method::GET,
            "/v1/foo",
            &[("host", "api-driver-dublin.elasticride.com")],
            "",
        );
        assert_eq!(e.hob(), "DUB");
        assert_eq!(e.value("city"), "DUB");
        assert_eq!(e.appended_city(), Some("DUB"));
    }

    #[test]
    fn test_body_overrides_query() {
        let mut e = extractor(
            Method::POST,
            "/v1/foo?device=from-query&only=query",
            &[("content-type", FORM_ENCODED_MIME)],
            "device=from-body",
        );
        assert_eq!(e.value("device"), "from-body");
        assert_eq!(e.value("only"), "query");
    }

    #[test]
    fn test_post_without_content_type_is_form_encoded() {
        let mut e = extractor(Method::POST, "/v1/foo", &[], "customer=12345");
        assert_eq!(e.value("customer"), "12345");

        // a GET with an unparseable content type does not parse the body
        let mut e = extractor(Method::GET, "/v1/foo", &[], "customer=12345");
        assert_eq!(e.value("customer"), "");
    }

    #[test]
    fn test_session_id_placed_under_key() {
        let mut e = extractor(
            Method::POST,
            "/v1/foo",
            &[("content-type", FORM_ENCODED_MIME)],
            "api_token=tok123",
        );
        assert_eq!(e.value("session_id"), "tok123");
    }

    #[test]
    fn test_source_from_host_then_header() {
        let mut e = extractor(Method::GET, "/", &[("host", "api-driver.elasticride.com")], "");
        assert_eq!(e.source(), "driver");

        let mut e = extractor(Method::GET, "/", &[("host", "api-customer.example.com")], "");
        assert_eq!(e.source(), "customer");

        let mut e = extractor(Method::GET, "/", &[("X-H-Source", "web")], "");
        assert_eq!(e.source(), "web");
    }
}
