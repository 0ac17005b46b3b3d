pub mod memory;
pub mod sled_cache;

pub use memory::MemoryStore;
pub use sled_cache::{CacheStats, SledStore};

use crate::config::is_image_content_type;
use crate::key::CacheKey;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("missing content type")]
    MissingContentType,
    #[error("content type {0:?} is not an allowed image type")]
    DisallowedContentType(String),
    #[error("refusing to store an empty body")]
    EmptyBody,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// An object as returned by a backing store, before any validation.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
}

/// Durable key/blob store the cache is persisted to.
///
/// `put` fully replaces whatever was stored under `key`, and must be
/// all-or-nothing. Implementations must tolerate concurrent independent
/// reads and writes.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, CacheError>;

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), CacheError>;
}

/// Quoted hex SHA-256 of the payload, used as the entry's integrity tag.
pub fn etag_for_bytes(bytes: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(bytes)))
}

/// A cache entry that passed validation and can be served as-is.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CachedImage),
    Miss,
}

/// Image cache on top of an [`ObjectStore`], namespacing every key under
/// a fixed prefix.
#[derive(Clone)]
pub struct ImageCache {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ImageCache {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn object_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Look up `key`. Absent, empty, and non-image entries are all misses,
    /// and so is a failing backend read.
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let object_key = self.object_key(key);
        let object = match self.store.get(&object_key).await {
            Ok(Some(object)) => object,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                tracing::warn!(
                    key = %object_key,
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                return CacheLookup::Miss;
            }
        };

        if object.bytes.is_empty() {
            tracing::debug!(key = %object_key, "Ignoring empty cache entry");
            return CacheLookup::Miss;
        }

        match object.content_type {
            Some(content_type) if is_image_content_type(&content_type) => {
                CacheLookup::Hit(CachedImage {
                    bytes: object.bytes,
                    content_type,
                    etag: object.etag,
                })
            }
            other => {
                tracing::debug!(
                    key = %object_key,
                    content_type = ?other,
                    "Ignoring cache entry with disallowed content type"
                );
                CacheLookup::Miss
            }
        }
    }

    /// Persist an image under `key`. Nothing is written unless the content
    /// type is an allowed image type and the body is non-empty.
    pub async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), CacheError> {
        let content_type = content_type.ok_or(CacheError::MissingContentType)?;
        if !is_image_content_type(content_type) {
            return Err(CacheError::DisallowedContentType(content_type.to_string()));
        }
        if bytes.is_empty() {
            return Err(CacheError::EmptyBody);
        }
        self.store.put(&self.object_key(key), bytes, content_type).await
    }
}
