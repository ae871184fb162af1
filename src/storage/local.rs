//! Local object store: sqlite metadata and on-disk payloads sharded
//! beneath `base_path/{shard}/{shard}/{key}`.
//!
//! Payload writes go through a temp file and an atomic rename, with the
//! metadata row upserted only after the payload is durable. The store is
//! scoped to the single configured bucket directory.

use super::{BackendError, BackendErrorKind, BackendResult, ByteStream, ObjectStore};
use crate::models::MediaObject;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
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

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Metadata row as stored in sqlite. The metadata map is a JSON column.
#[derive(sqlx::FromRow)]
struct ObjectRow {
    key: String,
    storage_id: String,
    size_bytes: i64,
    last_modified: DateTime<Utc>,
    metadata: String,
}

impl ObjectRow {
    fn into_media_object(self) -> MediaObject {
        MediaObject {
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            key: self.key,
            size: self.size_bytes.max(0) as u64,
            last_modified: self.last_modified,
            storage_id: self.storage_id,
        }
    }
}

/// Disk-backed [`ObjectStore`] with sqlite metadata.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<SqlitePool>,
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BackendError::new(
                BackendErrorKind::Other,
                format!("invalid object key `{key}`"),
            ));
        }
        Ok(())
    }

    /// Two-level shard identifiers for a key: the first two bytes of
    /// MD5(key) as lowercase hex. Keeps per-directory file counts low.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_row(&self, key: &str) -> BackendResult<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT key, storage_id, size_bytes, last_modified, metadata
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BackendError::not_found(key),
            other => sql_error("fetching object row", other),
        })
    }

    /// Write bytes to a temp file and rename into place, fsyncing first.
    /// Cleans up the temp file on any failure.
    async fn write_payload(&self, file_path: &Path, bytes: &[u8]) -> io::Result<()> {
        let parent = file_path
            .parent()
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            match fs::rename(&tmp_path, file_path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    fs::remove_file(file_path).await?;
                    fs::rename(&tmp_path, file_path).await
                }
                Err(err) => Err(err),
            }
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Recursively remove empty shard directories up to the store root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(()) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> BackendResult<ByteStream> {
        Self::ensure_key_safe(key)?;
        self.fetch_row(key).await?;

        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::not_found(key)
            } else {
                io_error("opening object payload", err)
            }
        })?;

        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn stat(&self, key: &str) -> BackendResult<MediaObject> {
        Self::ensure_key_safe(key)?;
        Ok(self.fetch_row(key).await?.into_media_object())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: HashMap<String, String>,
    ) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        self.write_payload(&file_path, &bytes)
            .await
            .map_err(|err| io_error("writing object payload", err))?;

        let metadata_json = serde_json::to_string(&metadata).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Other,
                format!("serializing object metadata: {err}"),
            )
        })?;

        let insert_result = sqlx::query(
            "INSERT INTO objects (key, storage_id, size_bytes, last_modified, metadata)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 storage_id = excluded.storage_id,
                 size_bytes = excluded.size_bytes,
                 last_modified = excluded.last_modified,
                 metadata = excluded.metadata",
        )
        .bind(key)
        .bind(Uuid::new_v4().to_string())
        .bind(bytes.len() as i64)
        .bind(Utc::now())
        .bind(&metadata_json)
        .execute(&*self.db)
        .await;

        match insert_result {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(sql_error("upserting object row", err))
            }
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;

        let result = sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await
            .map_err(|err| sql_error("deleting object row", err))?;
        if result.rows_affected() == 0 {
            return Err(BackendError::not_found(key));
        }

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(()) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(io_error("removing object payload", err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }

        Ok(())
    }
}

fn io_error(context: &str, err: io::Error) -> BackendError {
    let kind = match err.kind() {
        ErrorKind::NotFound => BackendErrorKind::NotFound,
        ErrorKind::TimedOut => BackendErrorKind::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => BackendErrorKind::Network,
        ErrorKind::Interrupted | ErrorKind::WouldBlock => BackendErrorKind::Unavailable,
        _ => BackendErrorKind::Internal,
    };
    BackendError::new(kind, format!("{context}: {err}"))
}

fn sql_error(context: &str, err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::RowNotFound => {
            BackendError::new(BackendErrorKind::NotFound, format!("{context}: no such row"))
        }
        sqlx::Error::Io(io_err) => io_error(context, io_err),
        sqlx::Error::PoolTimedOut => {
            BackendError::new(BackendErrorKind::Timeout, format!("{context}: pool timed out"))
        }
        sqlx::Error::Database(db_err)
            if {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            } =>
        {
            BackendError::new(
                BackendErrorKind::Unavailable,
                format!("{context}: {}", db_err.message()),
            )
        }
        other => BackendError::new(BackendErrorKind::Internal, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> (LocalStore, tempfile::TempDir) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        (LocalStore::new(Arc::new(pool), dir.path()), dir)
    }

    async fn drain(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn put_then_stat_and_get() {
        let (store, _dir) = test_store().await;
        let metadata = HashMap::from([("source".to_string(), "upload".to_string())]);
        store
            .put("photos/cat.png", Bytes::from_static(b"payload"), metadata)
            .await
            .unwrap();

        let meta = store.stat("photos/cat.png").await.unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.metadata.get("source").map(String::as_str), Some("upload"));

        let body = drain(store.get("photos/cat.png").await.unwrap()).await;
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn overwrite_replaces_payload_and_row() {
        let (store, _dir) = test_store().await;
        store
            .put("a.bin", Bytes::from_static(b"one"), HashMap::new())
            .await
            .unwrap();
        store
            .put("a.bin", Bytes::from_static(b"twotwo"), HashMap::new())
            .await
            .unwrap();

        let meta = store.stat("a.bin").await.unwrap();
        assert_eq!(meta.size, 6);
        assert_eq!(drain(store.get("a.bin").await.unwrap()).await, b"twotwo");
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let (store, _dir) = test_store().await;
        store
            .put("a.bin", Bytes::from_static(b"x"), HashMap::new())
            .await
            .unwrap();
        store.delete("a.bin").await.unwrap();
        assert!(store.stat("a.bin").await.unwrap_err().is_not_found());
        assert!(store.delete("a.bin").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (store, _dir) = test_store().await;
        let err = store
            .put("../escape", Bytes::from_static(b"x"), HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Other);
        assert!(store.stat("/rooted").await.is_err());
    }
}
