//! The HTTP surface of the proxy: server wiring, middleware chain, and the
//! per-action request handlers.

pub mod buffer;
pub mod cors;
pub mod endpoints;
pub mod h1;
pub mod h2;
pub mod handler;
pub mod pcifilter;
pub mod realip;
pub mod rpc;
pub mod server;

pub use server::{AppState, HttpServer};
