//! In-memory object store, used by tests and small embedded setups.

use super::{BackendResult, ByteStream, ObjectStore};
use crate::models::MediaObject;
use crate::storage::BackendError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use uuid::Uuid;

#[derive(Clone)]
struct StoredObject {
    bytes: Bytes,
    last_modified: DateTime<Utc>,
    storage_id: String,
    metadata: HashMap<String, String>,
}

/// Hash-map backed [`ObjectStore`]. Last writer wins on concurrent puts,
/// matching the write semantics the engine assumes of real backends.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects. Handy for asserting on detached cache
    /// writes in tests.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> BackendResult<ByteStream> {
        let bytes = self
            .objects
            .lock()
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| BackendError::not_found(key))?;
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(bytes)];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn stat(&self, key: &str) -> BackendResult<MediaObject> {
        let objects = self.objects.lock();
        let obj = objects.get(key).ok_or_else(|| BackendError::not_found(key))?;
        Ok(MediaObject {
            key: key.to_string(),
            size: obj.bytes.len() as u64,
            last_modified: obj.last_modified,
            storage_id: obj.storage_id.clone(),
            metadata: obj.metadata.clone(),
        })
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: HashMap<String, String>,
    ) -> BackendResult<()> {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                bytes,
                last_modified: Utc::now(),
                storage_id: Uuid::new_v4().to_string(),
                metadata,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.objects
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn put_get_stat_delete_roundtrip() {
        let store = MemoryStore::new();
        store
            .put("img/a.png", Bytes::from_static(b"pixels"), HashMap::new())
            .await
            .unwrap();

        let meta = store.stat("img/a.png").await.unwrap();
        assert_eq!(meta.size, 6);
        assert_eq!(meta.key, "img/a.png");

        let mut stream = store.get("img/a.png").await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"pixels");

        store.delete("img/a.png").await.unwrap();
        let err = store.stat("img/a.png").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
    }
}
