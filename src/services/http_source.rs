//! Read-only gateway over plain HTTP(S) object URLs.
//!
//! The source bucket is addressed by a base URL such as
//! `https://s3-us-west-2.amazonaws.com/public-artifacts`; the object at key
//! `a/b.tar.gz` is fetched from `<base>/a/b.tar.gz`.

use crate::{
    models::{
        object::{ObjectMeta, ObjectStream},
        object_key::ObjectKey,
    },
    services::gateway::{GatewayError, GatewayResult, StorageGateway},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    Client, Response, StatusCode, Url,
    header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, LAST_MODIFIED},
};
use std::io;
use tracing::debug;

pub struct HttpSource {
    client: Client,
    base: Url,
}

impl HttpSource {
    pub fn new(base: Url) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn object_url(&self, key: &ObjectKey) -> GatewayResult<Url> {
        let raw = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            key.url_path()
        );
        Url::parse(&raw).map_err(|err| GatewayError::Other(format!("bad object url {raw}: {err}")))
    }

    async fn send_head(&self, key: &ObjectKey) -> GatewayResult<Response> {
        let url = self.object_url(key)?;
        debug!(%url, "HEAD source object");
        self.client
            .head(url)
            .send()
            .await
            .map_err(classify_transport)
    }
}

#[async_trait]
impl StorageGateway for HttpSource {
    fn describe(&self) -> String {
        format!("http({})", self.base)
    }

    async fn exists(&self, key: &ObjectKey) -> GatewayResult<bool> {
        let response = self.send_head(key).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(classify_status(status, key)),
        }
    }

    async fn head(&self, key: &ObjectKey) -> GatewayResult<ObjectMeta> {
        let response = self.send_head(key).await?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), key));
        }
        Ok(meta_from_headers(response.headers()))
    }

    async fn read(&self, key: &ObjectKey) -> GatewayResult<ObjectStream> {
        let url = self.object_url(key)?;
        debug!(%url, "GET source object");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), key));
        }

        let meta = meta_from_headers(response.headers());
        let body = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();
        Ok(ObjectStream::new(meta, body))
    }

    async fn write(&self, _key: &ObjectKey, _body: Bytes, _meta: &ObjectMeta) -> GatewayResult<()> {
        Err(GatewayError::ReadOnly)
    }
}

fn classify_status(status: StatusCode, key: &ObjectKey) -> GatewayError {
    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(key.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::AccessDenied(format!("source answered {status} for `{key}`"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Transient(format!("source answered {status} for `{key}`"))
        }
        status if status.is_server_error() => {
            GatewayError::Transient(format!("source answered {status} for `{key}`"))
        }
        status => GatewayError::Other(format!("source answered {status} for `{key}`")),
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::Transient(err.to_string())
    } else {
        GatewayError::Other(err.to_string())
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn meta_from_headers(headers: &HeaderMap) -> ObjectMeta {
    let text = |name| header_str(headers, name);
    ObjectMeta {
        content_type: text(CONTENT_TYPE).map(str::to_string),
        content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        etag: text(ETAG).map(|v| v.trim_matches('"').to_string()),
        last_modified: text(LAST_MODIFIED)
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}
