//! Real client address resolution.
//!
//! Behind the load balancer the peer address is the balancer's, not the
//! client's. The recorded address is rewritten from `X-Forwarded-For` (first
//! entry) and `X-Forwarded-Port` (falling back to the peer's port), and made
//! available to handlers through an extension.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;

/// The client's address as this proxy best knows it.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

pub async fn real_ip_middleware(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let addr = match forwarded_for(&req) {
        Some(host) => {
            let port = forwarded_port(&req).unwrap_or_else(|| peer.port().to_string());
            format!("{host}:{port}")
        }
        None => peer.to_string(),
    };

    req.extensions_mut().insert(ClientAddr(addr));
    next.run(req).await
}

fn forwarded_for(req: &Request) -> Option<String> {
    let value = req.headers().get("X-Forwarded-For")?.to_str().ok()?;
    if value.is_empty() {
        return None;
    }
    // the first entry is the originating client
    Some(value.split(", ").next().unwrap_or(value).to_string())
}

fn forwarded_port(req: &Request) -> Option<String> {
    let value = req.headers().get("X-Forwarded-Port")?.to_str().ok()?;
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}
