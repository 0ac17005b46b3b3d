use crate::cache::{etag_for_bytes, CacheError, ObjectStore, StoredObject};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process object store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Write an object without a content type check, e.g. to seed entries
    /// that predate the current allowlist.
    pub async fn insert_raw(&self, key: &str, bytes: Bytes, content_type: Option<String>) {
        let etag = etag_for_bytes(&bytes);
        let object = StoredObject {
            bytes,
            content_type,
            etag,
        };
        self.objects.write().await.insert(key.to_string(), object);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, CacheError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), CacheError> {
        self.insert_raw(key, bytes, Some(content_type.to_string())).await;
        Ok(())
    }
}
