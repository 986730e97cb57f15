//! The storage capability the proxy is written against.
//!
//! The router and the fetch coordinator only ever see `dyn StorageGateway`;
//! the source (remote, read-only) and the target (local, read-write) are two
//! instances that may have entirely different implementations.

use crate::models::{
    object::{ObjectMeta, ObjectStream},
    object_key::ObjectKey,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;

/// Coarse classification of a storage failure.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    AccessDenied,
    Transient,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::AccessDenied => "access_denied",
            ErrorClass::Transient => "transient",
            ErrorClass::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage is read-only")]
    ReadOnly,
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::NotFound(_) => ErrorClass::NotFound,
            GatewayError::AccessDenied(_) => ErrorClass::AccessDenied,
            GatewayError::Transient(_) => ErrorClass::Transient,
            GatewayError::ReadOnly | GatewayError::Other(_) => ErrorClass::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => GatewayError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => GatewayError::AccessDenied(err.to_string()),
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => GatewayError::Transient(err.to_string()),
            _ => GatewayError::Other(err.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Read, write and existence checks against one bucket.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short label for logs, e.g. `http(https://host/bucket)`.
    fn describe(&self) -> String;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &ObjectKey) -> GatewayResult<bool>;

    /// Metadata only. Returns `GatewayError::NotFound` when absent.
    async fn head(&self, key: &ObjectKey) -> GatewayResult<ObjectMeta>;

    /// Open an object for streaming. Returns `GatewayError::NotFound` when absent.
    async fn read(&self, key: &ObjectKey) -> GatewayResult<ObjectStream>;

    /// Store `body` at `key`. The stored object must be readable once this
    /// returns `Ok`.
    async fn write(&self, key: &ObjectKey, body: Bytes, meta: &ObjectMeta) -> GatewayResult<()>;
}

/// Bound a gateway call by `limit`, if one is configured. An elapsed limit is
/// reported as a transient failure.
pub async fn with_timeout<T, F>(limit: Option<Duration>, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| GatewayError::Transient(format!("timed out after {limit:?}")))?,
        None => call.await,
    }
}
