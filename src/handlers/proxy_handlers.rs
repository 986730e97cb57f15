//! The request router: turn `(method, path)` into an object response.
//!
//! Hits are streamed straight from the target bucket. Misses go through the
//! fetch coordinator, which copies the object from the source into the target
//! before it is served. Every outcome is mapped to a status and a metric here,
//! so no error leaves this module as anything other than a response.

use crate::{
    config::ProxyConfig,
    errors::ProxyError,
    models::{
        object::{FetchOrigin, FetchedObject, ObjectMeta},
        object_key::ObjectKey,
    },
    services::{
        fetch_coordinator::FetchCoordinator,
        gateway::{StorageGateway, with_timeout},
        metrics::{MetricEvent, MetricKind, MetricsSink},
    },
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, warn};

pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache");

/// Shared, read-only state handed to every request.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub target: Arc<dyn StorageGateway>,
    pub coordinator: Arc<FetchCoordinator>,
    pub metrics: Arc<dyn MetricsSink>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    fn header_value(self) -> HeaderValue {
        match self {
            CacheStatus::Hit => HeaderValue::from_static("hit"),
            CacheStatus::Miss => HeaderValue::from_static("miss"),
        }
    }
}

impl ProxyState {
    pub fn new(
        config: ProxyConfig,
        source: Arc<dyn StorageGateway>,
        target: Arc<dyn StorageGateway>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let coordinator = FetchCoordinator::new(source, Arc::clone(&target))
            .with_timeouts(config.source_timeout, config.target_timeout)
            .with_max_object_size(config.max_object_bytes);
        Self {
            config: Arc::new(config),
            target,
            coordinator: Arc::new(coordinator),
            metrics,
        }
    }

    /// Serve one request. Only `GET` and `HEAD` reach the buckets.
    pub async fn handle(&self, method: &Method, raw_path: &str) -> Response {
        let started = Instant::now();
        let head_only = match *method {
            Method::GET => false,
            Method::HEAD => true,
            _ => return method_not_allowed(),
        };

        let key = match ObjectKey::from_request_path(&self.config.prefix, raw_path) {
            Ok(key) => key,
            Err(err) => {
                let err = ProxyError::from(err);
                warn!(path = raw_path, error = %err, "rejected request path");
                self.record_error(raw_path, started, &err);
                return err.into_response();
            }
        };

        match self.lookup_target(&key, head_only).await {
            Ok(Some(response)) => {
                debug!(key = %key, "cache hit");
                self.metrics.record(MetricEvent::new(
                    MetricKind::Hit,
                    key.as_str(),
                    started.elapsed(),
                ));
                return response;
            }
            Ok(None) => debug!(key = %key, "cache miss"),
            Err(err) => {
                error!(key = %key, error = %err, "target lookup failed");
                self.record_error(key.as_str(), started, &err);
                return err.into_response();
            }
        }

        match self.coordinator.resolve(&key).await {
            Ok(object) => {
                let kind = match object.origin {
                    FetchOrigin::Source => MetricKind::MissFilled,
                    FetchOrigin::Target => MetricKind::Hit,
                };
                self.metrics
                    .record(MetricEvent::new(kind, key.as_str(), started.elapsed()));
                fetched_response(object, head_only)
            }
            Err(err @ ProxyError::NotFound(_)) => {
                self.metrics.record(MetricEvent::new(
                    MetricKind::MissAbsent,
                    key.as_str(),
                    started.elapsed(),
                ));
                err.into_response()
            }
            Err(err) => {
                self.record_error(key.as_str(), started, &err);
                err.into_response()
            }
        }
    }

    /// `Ok(None)` is a miss. Any failure other than absence means the target
    /// cannot be trusted for this request and is an internal error.
    async fn lookup_target(
        &self,
        key: &ObjectKey,
        head_only: bool,
    ) -> Result<Option<Response>, ProxyError> {
        let limit = self.config.target_timeout;
        let found = if head_only {
            with_timeout(limit, self.target.head(key))
                .await
                .map(|meta| object_response(&meta, None, Body::empty(), CacheStatus::Hit))
        } else {
            with_timeout(limit, self.target.read(key)).await.map(|object| {
                let body = Body::from_stream(object.body);
                object_response(&object.meta, None, body, CacheStatus::Hit)
            })
        };

        match found {
            Ok(response) => Ok(Some(response)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(ProxyError::internal(format!(
                "target {} unavailable: {err}",
                self.target.describe()
            ))),
        }
    }

    fn record_error(&self, key: &str, started: Instant, err: &ProxyError) {
        self.metrics.record(
            MetricEvent::new(MetricKind::Error, key, started.elapsed())
                .with_error_class(err.class_tag()),
        );
    }
}

/// Fallback handler for every object path.
pub async fn proxy_object(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
) -> Response {
    state.handle(&method, uri.path()).await
}

fn method_not_allowed() -> Response {
    let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
    response
}

fn fetched_response(object: FetchedObject, head_only: bool) -> Response {
    let len = object.len();
    let body = if head_only {
        Body::empty()
    } else {
        Body::from(object.body)
    };
    let cache = match object.origin {
        FetchOrigin::Source => CacheStatus::Miss,
        FetchOrigin::Target => CacheStatus::Hit,
    };
    object_response(&object.meta, Some(len), body, cache)
}

fn object_response(
    meta: &ObjectMeta,
    len_override: Option<u64>,
    body: Body,
    cache: CacheStatus,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), meta, len_override);
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, cache.header_value());
    response
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta, len_override: Option<u64>) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(meta.content_type_or_default())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if let Some(length) = len_override.or(meta.content_length) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    if let Some(etag) = meta.etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(modified) = meta.last_modified {
        let http_date = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        gateway::ErrorClass, memory_gateway::MemoryGateway, metrics::MemoryMetricsSink,
    };
    use axum::body::to_bytes;
    use reqwest::Url;

    struct Fixture {
        source: Arc<MemoryGateway>,
        target: Arc<MemoryGateway>,
        metrics: Arc<MemoryMetricsSink>,
        state: ProxyState,
    }

    fn fixture(prefix: &str) -> Fixture {
        let source = Arc::new(MemoryGateway::read_only("source"));
        let target = Arc::new(MemoryGateway::new("target"));
        let metrics = Arc::new(MemoryMetricsSink::new());
        let config = ProxyConfig {
            source: Url::parse("https://source.example.com/bucket").unwrap(),
            bucket: "replica".into(),
            prefix: prefix.into(),
            source_timeout: None,
            target_timeout: None,
            max_object_bytes: None,
        };
        let state = ProxyState::new(config, source.clone(), target.clone(), metrics.clone());
        Fixture {
            source,
            target,
            metrics,
            state,
        }
    }

    async fn body_of(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn other_methods_are_rejected_without_backend_access() {
        let f = fixture("");
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let response = f.state.handle(&method, "/k").await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.headers()[header::ALLOW], "GET, HEAD");
        }
        assert_eq!(f.source.calls().read, 0);
        assert_eq!(f.target.calls().read, 0);
        assert!(f.metrics.events().is_empty());
    }

    #[tokio::test]
    async fn hit_is_served_from_target_only() {
        let f = fixture("");
        f.target.insert("a.txt", "cached", Some("text/plain"));

        let response = f.state.handle(&Method::GET, "/a.txt").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "6");
        assert_eq!(response.headers()[CACHE_STATUS_HEADER], "hit");
        assert_eq!(body_of(response).await, b"cached");
        assert_eq!(f.source.calls(), Default::default());
        assert_eq!(f.target.calls().write, 0);
        assert_eq!(f.metrics.count(MetricKind::Hit), 1);
    }

    #[tokio::test]
    async fn miss_is_filled_then_served() {
        let f = fixture("production");
        f.source.insert("production/prod/app.tar.gz", "0123456789", None);

        let response = f.state.handle(&Method::GET, "/prod/app.tar.gz").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_STATUS_HEADER], "miss");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(body_of(response).await, b"0123456789");
        assert!(f.target.contains("production/prod/app.tar.gz"));
        assert_eq!(f.metrics.count(MetricKind::MissFilled), 1);
    }

    #[tokio::test]
    async fn head_returns_headers_without_body() {
        let f = fixture("");
        f.source.insert("k", "0123456789", Some("application/gzip"));

        let miss = f.state.handle(&Method::HEAD, "/k").await;
        assert_eq!(miss.status(), StatusCode::OK);
        assert_eq!(miss.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_of(miss).await.is_empty());
        let reads_after_fill = f.target.calls().read;

        let hit = f.state.handle(&Method::HEAD, "/k").await;
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(hit.headers()[CACHE_STATUS_HEADER], "hit");
        assert_eq!(hit.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_of(hit).await.is_empty());
        assert_eq!(f.target.calls().read, reads_after_fill);
    }

    #[tokio::test]
    async fn absent_everywhere_is_404() {
        let f = fixture("");
        let response = f.state.handle(&Method::GET, "/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(f.target.calls().write, 0);
        assert_eq!(f.metrics.count(MetricKind::MissAbsent), 1);
    }

    #[tokio::test]
    async fn upstream_and_storage_failures_are_502() {
        let f = fixture("");
        f.source.insert("k", "v", None);

        f.source.fail_reads(Some(ErrorClass::Transient));
        let response = f.state.handle(&Method::GET, "/k").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[crate::errors::ERROR_CLASS_HEADER],
            "upstream.transient"
        );

        f.source.fail_reads(None);
        f.target.fail_writes(Some(ErrorClass::AccessDenied));
        let response = f.state.handle(&Method::GET, "/k").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let classes: Vec<_> = f
            .metrics
            .events()
            .into_iter()
            .filter_map(|e| e.error_class)
            .collect();
        assert_eq!(classes, ["upstream.transient", "storage.access_denied"]);
    }

    #[tokio::test]
    async fn unreachable_target_is_500() {
        let f = fixture("");
        f.target.fail_reads(Some(ErrorClass::Transient));

        let response = f.state.handle(&Method::GET, "/k").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(f.source.calls().read, 0);
        assert_eq!(f.metrics.count(MetricKind::Error), 1);
    }

    #[tokio::test]
    async fn malformed_paths_are_500() {
        let f = fixture("");
        let response = f.state.handle(&Method::GET, "/").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = f.state.handle(&Method::GET, "/a/../b").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(f.target.calls(), Default::default());
    }

    #[tokio::test]
    async fn slow_target_lookup_does_not_copy_twice() {
        let f = fixture("");
        f.source.insert("k", "payload", None);
        // The second lookup answers "missing" only after the first request's
        // fill has completed and released its ticket.
        f.target.slow_read(2, std::time::Duration::from_millis(100));

        let (first, second) = tokio::join!(
            f.state.handle(&Method::GET, "/k"),
            f.state.handle(&Method::GET, "/k"),
        );

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_of(first).await, b"payload");
        assert_eq!(body_of(second).await, b"payload");
        assert_eq!(f.source.calls().read, 1);
        assert_eq!(f.target.calls().write, 1);
        assert_eq!(f.metrics.count(MetricKind::MissFilled), 1);
        assert_eq!(f.metrics.count(MetricKind::Hit), 1);
    }
}
