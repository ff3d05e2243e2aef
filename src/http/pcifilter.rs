//! PCI path filtering.
//!
//! Card-data requests must go to the secure API, not through this proxy.
//! Requests whose "METHOD /path" appears in the configured sensitive list
//! are rejected unless they already passed the encryption proxy.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::ConfigSource;
use crate::lifecycle::Shutdown;

/// Hot-reloaded set of sensitive "METHOD /path" entries.
pub struct PciFilter {
    sensitive_paths: ArcSwap<HashSet<String>>,
}

impl PciFilter {
    pub fn new(source: Arc<ConfigSource>, shutdown: &Shutdown) -> Arc<Self> {
        let filter = Arc::new(Self {
            sensitive_paths: ArcSwap::from_pointee(HashSet::new()),
        });
        filter.load_config(&source);

        let reload = filter.clone();
        let mut changes = source.subscribe();
        let mut shutdown_rx = shutdown.subscribe();
        shutdown.spawn("pci-filter-reload", async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        tracing::trace!("PCI filter received config change");
                        reload.load_config(&source);
                    }
                }
            }
        });

        filter
    }

    fn load_config(&self, source: &ConfigSource) {
        let paths: HashSet<String> = source
            .string_list_at(&["pci", "sensitivePaths"])
            .into_iter()
            .collect();
        self.sensitive_paths.store(Arc::new(paths));
    }

    pub fn is_sensitive_request(&self, req: &Request) -> bool {
        let method_and_path = format!("{} {}", req.method(), req.uri().path());
        self.sensitive_paths.load().contains(&method_and_path)
            && req
                .headers()
                .get("X-Encrypted")
                .and_then(|v| v.to_str().ok())
                != Some("true")
    }
}

pub async fn pci_filter_middleware(
    State(filter): State<Arc<PciFilter>>,
    req: Request,
    next: Next,
) -> Response {
    if filter.is_sensitive_request(&req) {
        return (
            StatusCode::BAD_REQUEST,
            "Sensitive requests should be sent to the secure API",
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn filter_with(paths: &str) -> (Arc<PciFilter>, Arc<Shutdown>) {
        let source = Arc::new(ConfigSource::new());
        source
            .load(format!(r#"{{"pci":{{"sensitivePaths":{paths}}}}}"#).into_bytes())
            .unwrap();
        let shutdown = Arc::new(Shutdown::new());
        (PciFilter::new(source, &shutdown), shutdown)
    }

    #[tokio::test]
    async fn test_sensitive_path_detection() {
        let (filter, _shutdown) = filter_with(r#"["POST /v1/card"]"#);

        let sensitive = Request::builder()
            .method("POST")
            .uri("/v1/card")
            .body(Body::empty())
            .unwrap();
        assert!(filter.is_sensitive_request(&sensitive));

        let wrong_method = Request::builder()
            .method("GET")
            .uri("/v1/card")
            .body(Body::empty())
            .unwrap();
        assert!(!filter.is_sensitive_request(&wrong_method));

        let encrypted = Request::builder()
            .method("POST")
            .uri("/v1/card")
            .header("X-Encrypted", "true")
            .body(Body::empty())
            .unwrap();
        assert!(!filter.is_sensitive_request(&encrypted));
    }
}
