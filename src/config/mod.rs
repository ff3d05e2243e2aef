//! Configuration subsystem.
//!
//! Two layers:
//! - `schema`/`loader`: the static bootstrap configuration (listener address,
//!   timeouts, collaborator URLs) read once from a TOML file at startup.
//! - `source`: the dynamic configuration document (rules, regions, feature
//!   flags) that is hot-reloaded and fanned out to subscribers.

pub mod loader;
pub mod schema;
pub mod source;
pub mod validation;

pub use schema::ProxyConfig;
pub use source::ConfigSource;
