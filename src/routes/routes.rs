//! Defines the proxy's HTTP surface.
//!
//! ## Structure
//! - **Probe endpoints** (reserved `/_proxy` namespace)
//!   - `GET /_proxy/healthz`: liveness
//!   - `GET /_proxy/readyz` : target bucket reachability
//!
//! - **Object endpoints** (every other path)
//!   - `GET  /{*path}`: object bytes, copied from the source on a miss
//!   - `HEAD /{*path}`: same status and headers, no body
//!   - anything else  : 405
//!
//! Paths may be nested, e.g. `/prod/2025/app.tar.gz`.

use crate::handlers::{
    health_handlers::{healthz, readyz},
    proxy_handlers::{ProxyState, proxy_object},
};
use axum::{Router, routing::get};

/// Build and return the router carrying `ProxyState` to all handlers.
pub fn routes() -> Router<ProxyState> {
    Router::new()
        .route("/_proxy/healthz", get(healthz))
        .route("/_proxy/readyz", get(readyz))
        .fallback(proxy_object)
}
