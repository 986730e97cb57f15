//! Pull-through copy proxy for object storage.
//!
//! Objects are served from a regional target bucket when present; otherwise
//! they are copied once from a remote source bucket into the target and
//! served from that copy.

use axum::Router;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use config::{AppConfig, ProxyConfig};
pub use handlers::proxy_handlers::ProxyState;

/// The complete HTTP application for a given state.
pub fn app(state: ProxyState) -> Router {
    routes::routes::routes().with_state(state)
}
