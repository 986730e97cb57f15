//! Read-write gateway for an S3 bucket (or an S3-compatible endpoint).

use crate::{
    models::{
        object::{ObjectMeta, ObjectStream},
        object_key::ObjectKey,
    },
    services::gateway::{GatewayError, GatewayResult, StorageGateway},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::Region,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct S3Gateway {
    client: Client,
    bucket: String,
}

impl S3Gateway {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the standard AWS environment (credentials chain)
    /// for `region`, optionally against a custom S3-compatible endpoint.
    pub async fn from_env(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        let path_style = endpoint_url.is_some();
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.into()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(path_style)
                .build(),
        );
        Self::new(client, bucket)
    }
}

#[async_trait]
impl StorageGateway for S3Gateway {
    fn describe(&self) -> String {
        format!("s3({})", self.bucket)
    }

    async fn exists(&self, key: &ObjectKey) -> GatewayResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn head(&self, key: &ObjectKey) -> GatewayResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, key))?;

        Ok(ObjectMeta {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|len| u64::try_from(len).ok()),
            etag: output.e_tag().map(|e| e.trim_matches('"').to_string()),
            last_modified: output.last_modified().and_then(to_chrono),
        })
    }

    async fn read(&self, key: &ObjectKey) -> GatewayResult<ObjectStream> {
        debug!(bucket = %self.bucket, key = %key, "GetObject");
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, key))?;

        let meta = ObjectMeta {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|len| u64::try_from(len).ok()),
            etag: output.e_tag().map(|e| e.trim_matches('"').to_string()),
            last_modified: output.last_modified().and_then(to_chrono),
        };
        let body = ReaderStream::new(output.body.into_async_read()).boxed();
        Ok(ObjectStream::new(meta, body))
    }

    async fn write(&self, key: &ObjectKey, body: Bytes, meta: &ObjectMeta) -> GatewayResult<()> {
        debug!(bucket = %self.bucket, key = %key, bytes = body.len(), "PutObject");
        let length = i64::try_from(body.len())
            .map_err(|_| GatewayError::Other(format!("object `{key}` too large")))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(length)
            .set_content_type(meta.content_type.clone())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| classify_sdk_error(err, key))?;
        Ok(())
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
}

fn classify_sdk_error<E>(err: SdkError<E>, key: &ObjectKey) -> GatewayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|raw| raw.status().as_u16());
    let message = DisplayErrorContext(&err).to_string();
    match (&err, status) {
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _) => {
            GatewayError::Transient(message)
        }
        (_, Some(404)) => GatewayError::NotFound(key.to_string()),
        (_, Some(401 | 403)) => GatewayError::AccessDenied(message),
        (_, Some(408 | 429)) => GatewayError::Transient(message),
        (_, Some(code)) if code >= 500 => GatewayError::Transient(message),
        (SdkError::ResponseError(_), _) => GatewayError::Transient(message),
        _ => GatewayError::Other(message),
    }
}
