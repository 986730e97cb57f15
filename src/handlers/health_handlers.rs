//! Health & readiness handlers.
//!
//! - GET /_proxy/healthz  -> simple liveness ("ok")
//! - GET /_proxy/readyz   -> readiness that checks the target bucket answers

use crate::{
    handlers::proxy_handlers::ProxyState,
    models::object_key::ObjectKey,
    services::gateway::with_timeout,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, time::Duration};

const READY_PROBE_KEY: &str = "_proxy/readyz-probe";
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /_proxy/healthz`
///
/// Very small liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /_proxy/readyz`
///
/// Issues an existence check for a probe key against the target bucket. Any
/// answer, present or absent, means the target is reachable: HTTP 200.
/// A failure or a timeout gives HTTP 503.
pub async fn readyz(State(state): State<ProxyState>) -> impl IntoResponse {
    let target_check = match ObjectKey::new(READY_PROBE_KEY) {
        Ok(key) => match with_timeout(Some(READY_PROBE_TIMEOUT), state.target.exists(&key)).await
        {
            Ok(_) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(e) => CheckStatus {
                ok: false,
                error: Some(format!("error: {}", e)),
            },
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("probe key: {}", e)),
        },
    };

    let overall_ok = target_check.ok;
    let mut checks = HashMap::new();
    checks.insert("target", target_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        target: state.target.describe(),
        in_flight: state.coordinator.in_flight(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    target: String,
    in_flight: usize,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
