use crate::{models::object_key::KeyError, services::gateway::ErrorClass};
use axum::{
    Json,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub const ERROR_CLASS_HEADER: HeaderName = HeaderName::from_static("x-proxy-error-class");

/// Outcome of a request that could not be served.
///
/// Cloneable so a single failed fetch can be handed to every request that
/// was waiting on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Object absent at the source.
    #[error("object `{0}` not found upstream")]
    NotFound(String),

    /// Source read failed for a reason other than absence.
    #[error("upstream read failed ({class}): {message}")]
    Upstream { class: ErrorClass, message: String },

    /// Target write failed after a successful source read.
    #[error("cache write failed ({class}): {message}")]
    Storage { class: ErrorClass, message: String },

    /// Anything unexpected, including malformed keys and an unreachable target.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Upstream { .. } | ProxyError::Storage { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Tag used for the `x-proxy-error-class` header and error metrics,
    /// e.g. `upstream.transient` or `storage.access_denied`.
    pub fn class_tag(&self) -> String {
        match self {
            ProxyError::NotFound(_) => "not_found".to_string(),
            ProxyError::Upstream { class, .. } => format!("upstream.{class}"),
            ProxyError::Storage { class, .. } => format!("storage.{class}"),
            ProxyError::Internal(_) => "internal".to_string(),
        }
    }
}

impl From<KeyError> for ProxyError {
    fn from(err: KeyError) -> Self {
        ProxyError::Internal(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let class = self.class_tag();
        let body = Json(json!({
            "error": self.to_string(),
            "class": class,
            "status": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        if let Ok(value) = HeaderValue::from_str(&class) {
            response.headers_mut().insert(ERROR_CLASS_HEADER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_taxonomy() {
        assert_eq!(ProxyError::NotFound("k".into()).status(), StatusCode::NOT_FOUND);
        let upstream = ProxyError::Upstream {
            class: ErrorClass::Transient,
            message: "reset".into(),
        };
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.class_tag(), "upstream.transient");

        let storage = ProxyError::Storage {
            class: ErrorClass::AccessDenied,
            message: "denied".into(),
        };
        assert_eq!(storage.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(storage.class_tag(), "storage.access_denied");

        assert_eq!(
            ProxyError::internal("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn key_errors_are_internal() {
        let err: ProxyError = KeyError::Empty.into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_echoes_the_error_class() {
        let response = ProxyError::NotFound("k".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(ERROR_CLASS_HEADER).unwrap(),
            "not_found"
        );
    }
}
