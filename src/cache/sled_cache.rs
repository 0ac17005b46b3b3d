use crate::cache::{etag_for_bytes, CacheError, ObjectStore, StoredObject};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionResult;
use sled::{Db, IVec};
use std::path::Path;

/// Metadata stored alongside cached objects
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EntryMetadata {
    pub key: String,
    pub content_type: String,
    pub size: usize,
    pub etag: String,
    pub created_at: i64,
}

/// Statistics about the store
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub entry_count: usize,
}

impl From<sled::Error> for CacheError {
    fn from(e: sled::Error) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Sled-backed object store
///
/// Each object is kept as two records in the same tree:
/// - `data:<key>` holding the raw bytes
/// - `meta:<key>` holding JSON [`EntryMetadata`]
///
/// Both are written in one transaction and flushed before `put` returns.
/// `get` reads both inside a transaction too, so a reader never pairs the
/// bytes of one write with the metadata of another.
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = sled::open(path)
            .map_err(|e| CacheError::Backend(format!("Failed to open Sled database: {}", e)))?;
        Ok(Self { db })
    }

    /// Store that lives in a temporary directory removed on drop
    pub fn temporary() -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn metadata_key(key: &str) -> String {
        format!("meta:{}", key)
    }

    fn data_key(key: &str) -> String {
        format!("data:{}", key)
    }

    /// Get store statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_size_bytes: 0,
            entry_count: 0,
        };

        for (_, value) in self.db.scan_prefix("meta:").flatten() {
            if let Ok(meta) = serde_json::from_slice::<EntryMetadata>(&value) {
                stats.total_size_bytes += meta.size as u64;
                stats.entry_count += 1;
            }
        }

        stats
    }
}

#[async_trait::async_trait]
impl ObjectStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, CacheError> {
        let data_key = Self::data_key(key);
        let meta_key = Self::metadata_key(key);

        let read: TransactionResult<(Option<IVec>, Option<IVec>), ()> =
            self.db.transaction(|tx| {
                let data = tx.get(data_key.as_bytes())?;
                let meta = tx.get(meta_key.as_bytes())?;
                Ok((data, meta))
            });
        let (data, meta) =
            read.map_err(|e| CacheError::Backend(format!("Failed to read cache entry: {:?}", e)))?;

        let Some(data) = data else {
            return Ok(None);
        };
        let data = Bytes::copy_from_slice(&data);
        let meta = meta.and_then(|m| serde_json::from_slice::<EntryMetadata>(&m).ok());

        // Entries without readable metadata come back untyped; the cache
        // adapter refuses to serve those.
        let object = match meta {
            Some(meta) => StoredObject {
                bytes: data,
                content_type: Some(meta.content_type),
                etag: meta.etag,
            },
            None => {
                tracing::warn!(key, "Cache entry has no readable metadata");
                let etag = etag_for_bytes(&data);
                StoredObject {
                    bytes: data,
                    content_type: None,
                    etag,
                }
            }
        };

        Ok(Some(object))
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), CacheError> {
        let metadata = EntryMetadata {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
            etag: etag_for_bytes(&bytes),
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        };
        let meta = serde_json::to_vec(&metadata)
            .map_err(|e| CacheError::Backend(format!("Failed to encode cache metadata: {}", e)))?;

        let data_key = Self::data_key(key);
        let meta_key = Self::metadata_key(key);

        let result: TransactionResult<(), ()> = self.db.transaction(|tx| {
            tx.insert(data_key.as_bytes(), bytes.as_ref())?;
            tx.insert(meta_key.as_bytes(), meta.as_slice())?;
            Ok(())
        });
        result.map_err(|e| CacheError::Backend(format!("Failed to write cache entry: {:?}", e)))?;

        // Flush to disk
        self.db.flush_async().await?;

        Ok(())
    }
}
