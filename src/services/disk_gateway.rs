//! src/services/disk_gateway.rs
//!
//! DiskGateway: a target bucket on local disk, with object metadata in
//! SQLite and payloads sharded beneath `base_path/{shard}/{shard}/{digest}`.
//! Suited to single-host deployments and local development where no regional
//! bucket is available.

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
use futures::StreamExt;
use sqlx::{FromRow, SqlitePool};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Metadata row for one stored object.
#[derive(Clone, Debug, FromRow)]
struct DiskObject {
    key: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl From<DiskObject> for ObjectMeta {
    fn from(row: DiskObject) -> Self {
        ObjectMeta {
            content_type: row.content_type,
            content_length: u64::try_from(row.size_bytes).ok(),
            etag: Some(row.etag),
            last_modified: Some(row.last_modified),
        }
    }
}

#[derive(Clone)]
pub struct DiskGateway {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl DiskGateway {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Create the metadata schema if it does not exist yet.
    pub async fn migrate(&self) -> GatewayResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt)
                .execute(&*self.db)
                .await
                .map_err(db_error)?;
        }
        Ok(statements.len())
    }

    /// Two-level shard identifiers for a key: the first two bytes of
    /// MD5(key) as lowercase hex. Keeps directory fan-out bounded.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payloads are named by the full key digest, never by the key itself,
    /// so `a` and `a/b` (or `dir/`) map to distinct plain files.
    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key.as_str());
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{:x}", md5::compute(key.as_str())));
        path
    }

    async fn fetch_object(&self, key: &ObjectKey) -> GatewayResult<DiskObject> {
        sqlx::query_as::<_, DiskObject>(
            "SELECT key, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key.as_str())
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => GatewayError::NotFound(key.to_string()),
            other => db_error(other),
        })
    }

    /// Write bytes to a temp file beside the final path, fsync, then rename
    /// into place. The temp file is removed on any failure.
    async fn write_payload(&self, file_path: &Path, body: &Bytes) -> GatewayResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            GatewayError::Other("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(body).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, file_path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for DiskGateway {
    fn describe(&self) -> String {
        format!("disk({})", self.base_path.display())
    }

    async fn exists(&self, key: &ObjectKey) -> GatewayResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE key = ?")
            .bind(key.as_str())
            .fetch_one(&*self.db)
            .await
            .map_err(db_error)?;
        Ok(count > 0)
    }

    async fn head(&self, key: &ObjectKey) -> GatewayResult<ObjectMeta> {
        self.fetch_object(key).await.map(ObjectMeta::from)
    }

    /// Returns NotFound if the metadata row exists but the payload is gone.
    async fn read(&self, key: &ObjectKey) -> GatewayResult<ObjectStream> {
        let object = self.fetch_object(key).await?;
        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                GatewayError::NotFound(key.to_string())
            } else {
                GatewayError::from(err)
            }
        })?;

        Ok(ObjectStream::new(
            object.into(),
            ReaderStream::new(file).boxed(),
        ))
    }

    async fn write(&self, key: &ObjectKey, body: Bytes, meta: &ObjectMeta) -> GatewayResult<()> {
        let file_path = self.object_path(key);
        self.write_payload(&file_path, &body).await?;

        let etag = format!("{:x}", md5::compute(&body));
        let size_bytes = i64::try_from(body.len())
            .map_err(|_| GatewayError::Other(format!("object `{key}` too large")))?;

        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (id, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.as_str())
        .bind(meta.content_type.clone())
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        if let Err(err) = upsert {
            let _ = fs::remove_file(&file_path).await;
            return Err(db_error(err));
        }
        debug!("stored {} ({} bytes) at {}", key, size_bytes, file_path.display());
        Ok(())
    }
}

fn db_error(err: sqlx::Error) -> GatewayError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            GatewayError::Transient(err.to_string())
        }
        sqlx::Error::Io(io_err) if io_err.kind() != ErrorKind::NotFound => {
            GatewayError::Transient(io_err.to_string())
        }
        other => GatewayError::Other(other.to_string()),
    }
}
