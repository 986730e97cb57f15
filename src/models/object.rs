//! Represents an object (blob) as it moves between buckets and clients.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use std::{fmt, io};

/// Content type served when a bucket does not record one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Streaming object payload.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Metadata stored alongside an object.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Content type (MIME type), if the bucket recorded one.
    pub content_type: Option<String>,

    /// Size in bytes, if known before the body is read.
    pub content_length: Option<u64>,

    /// Entity tag as reported by the bucket, without quotes.
    pub etag: Option<String>,

    /// Timestamp when the object was last modified.
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// An object opened for reading: metadata plus a body stream.
pub struct ObjectStream {
    pub meta: ObjectMeta,
    pub body: ByteStream,
}

impl ObjectStream {
    pub fn new(meta: ObjectMeta, body: ByteStream) -> Self {
        Self { meta, body }
    }

    /// Wrap bytes already held in memory.
    pub fn from_bytes(meta: ObjectMeta, body: Bytes) -> Self {
        let body = futures::stream::once(async move { Ok(body) }).boxed();
        Self { meta, body }
    }
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Where a resolved miss was served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
    /// Read from the source and committed to the target by this fetch.
    Source,
    /// Already in the target when the fetch started; another fill won the race.
    Target,
}

/// An object fully read into memory by a fetch.
///
/// Cloning is cheap: the body is reference counted, so every request that
/// joined the same fetch shares one buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedObject {
    pub meta: ObjectMeta,
    pub body: Bytes,
    pub origin: FetchOrigin,
}

impl FetchedObject {
    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
