use crate::cache::ImageCache;
use crate::config::is_image_content_type;
use crate::fetch::{BodyStream, OriginError, OriginResponse};
use crate::key::CacheKey;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use http::{header, HeaderMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Chunks buffered between the upstream body and a slow caller.
const CHANNEL_CAPACITY: usize = 16;

/// Runs work detached from the response that scheduled it.
///
/// Implementations must run every scheduled task to completion even after
/// the response has been sent; the task's outcome is never reported back.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: BoxFuture<'static, ()>);
}

/// [`TaskScheduler`] on the tokio runtime. Tasks are tracked so shutdown
/// can wait for pending cache writes.
#[derive(Clone, Default)]
pub struct TrackedScheduler {
    tracker: TaskTracker,
}

impl TrackedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every scheduled task has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl TaskScheduler for TrackedScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        self.tracker.spawn(task);
    }
}

/// Persists successful upstream responses into the cache without holding
/// up the caller.
#[derive(Clone)]
pub struct WriteBack {
    cache: ImageCache,
    scheduler: Arc<dyn TaskScheduler>,
    max_object_size: usize,
}

impl WriteBack {
    pub fn new(
        cache: ImageCache,
        scheduler: Arc<dyn TaskScheduler>,
        max_object_size: usize,
    ) -> Self {
        Self {
            cache,
            scheduler,
            max_object_size,
        }
    }

    /// Schedule the write-back for `response` and return the response to
    /// hand to the caller.
    ///
    /// The background task owns the upstream body: it forwards every chunk
    /// to the returned response while buffering a copy, and stores the copy
    /// once the body is complete. The caller going away does not stop the
    /// task.
    pub fn attach(&self, key: CacheKey, response: OriginResponse) -> OriginResponse {
        let OriginResponse {
            status,
            headers,
            body,
        } = response;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let job = PendingWrite {
            cache: self.cache.clone(),
            key,
            headers: headers.clone(),
            max_object_size: self.max_object_size,
        };
        self.scheduler.schedule(Box::pin(job.run(body, tx)));

        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        OriginResponse {
            status,
            headers,
            body,
        }
    }
}

struct PendingWrite {
    cache: ImageCache,
    key: CacheKey,
    headers: HeaderMap,
    max_object_size: usize,
}

impl PendingWrite {
    /// Content type to store under, or `None` when the response must not
    /// be cached. Encoded bodies are skipped since hits are served without
    /// a `Content-Encoding`.
    fn cacheable_content_type(&self) -> Option<String> {
        if let Some(encoding) = self.headers.get(header::CONTENT_ENCODING) {
            if !encoding.as_bytes().eq_ignore_ascii_case(b"identity") {
                return None;
            }
        }
        let content_type = self.headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
        is_image_content_type(content_type).then(|| content_type.to_string())
    }

    async fn run(self, mut upstream: BodyStream, tx: mpsc::Sender<Result<Bytes, OriginError>>) {
        let content_type = self.cacheable_content_type();
        if content_type.is_none() {
            tracing::debug!(
                key = %self.key,
                content_type = ?self.headers.get(header::CONTENT_TYPE),
                "Upstream response is not a cacheable image, skipping write-back"
            );
        }

        let mut buf = BytesMut::new();
        let mut buffering = content_type.is_some();
        let mut caller_gone = false;

        while let Some(item) = upstream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    if buffering {
                        tracing::warn!(
                            key = %self.key,
                            error = %e,
                            "Upstream body failed, skipping write-back"
                        );
                    }
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            if buffering {
                if buf.len() + chunk.len() > self.max_object_size {
                    tracing::debug!(
                        key = %self.key,
                        limit = self.max_object_size,
                        "Upstream body exceeds cache object limit, skipping write-back"
                    );
                    buffering = false;
                    buf = BytesMut::new();
                } else {
                    buf.extend_from_slice(&chunk);
                }
            }

            if !caller_gone && tx.send(Ok(chunk)).await.is_err() {
                caller_gone = true;
                tracing::debug!(key = %self.key, "Caller disconnected before body completed");
            }

            // Nobody left to serve and nothing to store.
            if caller_gone && !buffering {
                return;
            }
        }
        drop(tx);

        let Some(content_type) = content_type else {
            return;
        };
        if !buffering {
            return;
        }
        if buf.is_empty() {
            tracing::debug!(key = %self.key, "Upstream body is empty, skipping write-back");
            return;
        }

        let size = buf.len();
        let stored = self
            .cache
            .store(&self.key, buf.freeze(), Some(&content_type))
            .await;
        match stored {
            Ok(()) => tracing::info!(
                key = %self.key,
                size,
                content_type = %content_type,
                "Stored upstream image in cache"
            ),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "Failed to write image to cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLookup, MemoryStore};
    use crate::key::NormalizedParams;
    use http::{HeaderValue, StatusCode};

    fn setup(max: usize) -> (ImageCache, TrackedScheduler, WriteBack) {
        let cache = ImageCache::new(Arc::new(MemoryStore::new()), "image-cache/");
        let scheduler = TrackedScheduler::new();
        let writeback = WriteBack::new(cache.clone(), Arc::new(scheduler.clone()), max);
        (cache, scheduler, writeback)
    }

    fn response(content_type: &'static str, chunks: Vec<&'static [u8]>) -> OriginResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        let chunks = chunks.into_iter().map(|c| Ok(Bytes::from_static(c)));
        let body = stream::iter(chunks).boxed();
        OriginResponse {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    async fn collect(body: BodyStream) -> Vec<u8> {
        body.fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk.unwrap());
            acc
        })
        .await
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::derive(path, &NormalizedParams::default())
    }

    #[tokio::test]
    async fn forwards_body_and_stores_copy() {
        let (cache, scheduler, writeback) = setup(1024);
        let out = writeback.attach(
            key("/assets/a.png"),
            response("image/png", vec![b"ab", b"cd"]),
        );

        assert_eq!(out.status, StatusCode::OK);
        assert_eq!(out.content_type(), Some("image/png"));
        assert_eq!(collect(out.body).await, b"abcd");

        scheduler.drain().await;
        match cache.lookup(&key("/assets/a.png")).await {
            CacheLookup::Hit(img) => assert_eq!(&img.bytes[..], b"abcd"),
            CacheLookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn skips_non_image_bodies() {
        let (cache, scheduler, writeback) = setup(1024);
        let out = writeback.attach(
            key("/assets/page"),
            response("text/html", vec![b"<html>"]),
        );
        assert_eq!(collect(out.body).await, b"<html>");

        scheduler.drain().await;
        assert!(matches!(
            cache.lookup(&key("/assets/page")).await,
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn skips_bodies_over_limit() {
        let (cache, scheduler, writeback) = setup(3);
        let out = writeback.attach(
            key("/assets/big.png"),
            response("image/png", vec![b"ab", b"cd"]),
        );
        assert_eq!(collect(out.body).await, b"abcd");

        scheduler.drain().await;
        assert!(matches!(
            cache.lookup(&key("/assets/big.png")).await,
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn skips_encoded_bodies() {
        let (cache, scheduler, writeback) = setup(1024);
        let mut resp = response("image/svg+xml", vec![b"gz"]);
        resp.headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let out = writeback.attach(key("/assets/a.svg"), resp);
        assert_eq!(collect(out.body).await, b"gz");

        scheduler.drain().await;
        assert!(matches!(
            cache.lookup(&key("/assets/a.svg")).await,
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn stores_even_if_caller_drops_response() {
        let (cache, scheduler, writeback) = setup(1024);
        let out = writeback.attach(
            key("/assets/gone.png"),
            response("image/png", vec![b"a", b"b", b"c"]),
        );
        drop(out);

        scheduler.drain().await;
        match cache.lookup(&key("/assets/gone.png")).await {
            CacheLookup::Hit(img) => assert_eq!(&img.bytes[..], b"abc"),
            CacheLookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn upstream_body_error_reaches_caller_and_skips_store() {
        let (cache, scheduler, writeback) = setup(1024);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(OriginError::Body("reset".into())),
        ])
        .boxed();
        let upstream = OriginResponse {
            status: StatusCode::OK,
            headers,
            body,
        };
        let out = writeback.attach(key("/assets/cut.png"), upstream);

        let items: Vec<_> = out.body.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());

        scheduler.drain().await;
        assert!(matches!(
            cache.lookup(&key("/assets/cut.png")).await,
            CacheLookup::Miss
        ));
    }
}
