use crate::key::NormalizedParams;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http::{header, HeaderMap, Method, StatusCode};
use reqwest::Client;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Redirects followed before giving up on a final response.
pub const MAX_REDIRECTS: usize = 5;

// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("Invalid upstream origin: {0}")]
    InvalidOrigin(String),
    #[error("Upstream request failed: {0}")]
    Transport(String),
    #[error("Upstream body failed: {0}")]
    Body(String),
}

pub type BodyStream = BoxStream<'static, Result<Bytes, OriginError>>;

/// What the proxy sends upstream: the caller's method, the headers that
/// survive [`forwardable_headers`], the path, and the normalized parameters
/// in place of the original query string.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub path: String,
    pub params: NormalizedParams,
}

pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl OriginResponse {
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let body = stream::once(async move { Ok::<_, OriginError>(body) });
        Self {
            status,
            headers,
            body: body.boxed(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for OriginResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Result of one upstream attempt that did not fail at the transport level.
#[derive(Debug)]
pub enum OriginOutcome {
    Success(OriginResponse),
    FailureResponse(OriginResponse),
    NoResponse,
}

impl OriginOutcome {
    pub fn classify(response: OriginResponse) -> Self {
        if response.status.is_success() {
            OriginOutcome::Success(response)
        } else {
            OriginOutcome::FailureResponse(response)
        }
    }
}

/// The single upstream the proxy fills its cache from.
#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    async fn send(&self, request: OriginRequest) -> Result<OriginOutcome, OriginError>;
}

/// [`Origin`] over HTTPS using reqwest. One attempt per call, no retries.
pub struct HttpOrigin {
    client: Client,
    base: Url,
}

impl HttpOrigin {
    pub fn new(base: Url) -> Result<Self, OriginError> {
        if base.scheme() != "https" || base.host_str().is_none() {
            return Err(OriginError::InvalidOrigin(base.to_string()));
        }
        let mut base = base;
        // Always the scheme's default port.
        base.set_port(None)
            .map_err(|_| OriginError::InvalidOrigin(base.to_string()))?;
        Self::with_base(base)
    }

    fn with_base(base: Url) -> Result<Self, OriginError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        Ok(Self { client, base })
    }

    pub fn upstream_url(&self, path: &str, params: &NormalizedParams) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        let query = params.to_query_string();
        url.set_query(if query.is_empty() {
            None
        } else {
            Some(query.as_str())
        });
        url
    }
}

/// Caller headers minus `Host`, `Content-Length`, `Accept-Encoding` and
/// hop-by-hop headers.
///
/// `Accept-Encoding` is dropped so the origin answers with an identity
/// body, the only kind the cache stores and serves.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out.remove(header::ACCEPT_ENCODING);
    strip_hop_by_hop(&mut out);
    out
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[async_trait::async_trait]
impl Origin for HttpOrigin {
    async fn send(&self, request: OriginRequest) -> Result<OriginOutcome, OriginError> {
        let url = self.upstream_url(&request.path, &request.params);
        tracing::debug!(url = %url, method = %request.method, "Fetching from upstream");

        let resp = match self
            .client
            .request(request.method, url.clone())
            .headers(request.headers)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_redirect() => {
                tracing::warn!(
                    url = %url,
                    error = %e,
                    "Upstream redirect chain produced no response"
                );
                return Ok(OriginOutcome::NoResponse);
            }
            Err(e) => return Err(OriginError::Transport(e.to_string())),
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| OriginError::Body(e.to_string())))
            .boxed();

        tracing::debug!(url = %url, status = %status, "Upstream responded");
        Ok(OriginOutcome::classify(OriginResponse {
            status,
            headers,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Redirect;
    use axum::Router;
    use http::HeaderValue;

    fn origin() -> HttpOrigin {
        HttpOrigin::new(Url::parse("https://images.example.com").unwrap()).unwrap()
    }

    /// Serve `app` on a local port and return its base URL.
    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    fn get(path: &str) -> OriginRequest {
        OriginRequest {
            method: Method::GET,
            headers: HeaderMap::new(),
            path: path.to_string(),
            params: NormalizedParams::default(),
        }
    }

    #[test]
    fn upstream_url_replaces_query() {
        let params = NormalizedParams::from_query(Some("w=200&z=ignored&h=100"));
        let url = origin().upstream_url("/assets/logo.png", &params);
        assert_eq!(
            url.as_str(),
            "https://images.example.com/assets/logo.png?h=100&w=200"
        );
    }

    #[test]
    fn upstream_url_without_params_has_no_query() {
        let url = origin().upstream_url("/assets/logo.png", &NormalizedParams::default());
        assert_eq!(url.as_str(), "https://images.example.com/assets/logo.png");
    }

    #[test]
    fn upstream_url_keeps_encoded_path() {
        let url = origin().upstream_url("/assets/my%20logo.png", &NormalizedParams::default());
        assert_eq!(url.path(), "/assets/my%20logo.png");
    }

    #[test]
    fn port_is_pinned_to_default() {
        let base = Url::parse("https://images.example.com:8443").unwrap();
        let url = HttpOrigin::new(base)
            .unwrap()
            .upstream_url("/a.png", &NormalizedParams::default());
        assert_eq!(url.port_or_known_default(), Some(443));
    }

    #[test]
    fn rejects_plain_http_origin() {
        assert!(HttpOrigin::new(Url::parse("http://images.example.com").unwrap()).is_err());
    }

    #[test]
    fn forwardable_headers_drop_host_encoding_and_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("image/webp"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let out = forwardable_headers(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "image/webp");
        assert_eq!(out.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn classify_by_status() {
        let ok = OriginResponse::from_bytes(StatusCode::OK, HeaderMap::new(), Bytes::new());
        assert!(matches!(
            OriginOutcome::classify(ok),
            OriginOutcome::Success(_)
        ));

        let missing =
            OriginResponse::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
        assert!(matches!(
            OriginOutcome::classify(missing),
            OriginOutcome::FailureResponse(_)
        ));

        let moved = OriginResponse::from_bytes(
            StatusCode::MOVED_PERMANENTLY,
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(matches!(
            OriginOutcome::classify(moved),
            OriginOutcome::FailureResponse(_)
        ));
    }

    #[tokio::test]
    async fn endless_redirects_yield_no_response() {
        let app = Router::new().fallback(|| async { Redirect::temporary("/again") });
        let origin = HttpOrigin::with_base(serve(app).await).unwrap();

        let outcome = origin.send(get("/assets/loop.png")).await.unwrap();
        assert!(matches!(outcome, OriginOutcome::NoResponse));
    }

    #[tokio::test]
    async fn streams_successful_response() {
        let app = Router::new().fallback(|| async {
            ([(header::CONTENT_TYPE, "image/png")], "png-bytes")
        });
        let origin = HttpOrigin::with_base(serve(app).await).unwrap();

        match origin.send(get("/assets/logo.png")).await.unwrap() {
            OriginOutcome::Success(response) => {
                assert_eq!(response.content_type(), Some("image/png"));
                let chunks: Vec<_> = response.body.collect().await;
                let body: Vec<u8> = chunks
                    .into_iter()
                    .flat_map(|c| c.unwrap().to_vec())
                    .collect();
                assert_eq!(body, b"png-bytes");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_origin_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let base = Url::parse(&format!("http://{}", addr)).unwrap();
        let origin = HttpOrigin::with_base(base).unwrap();
        let err = origin.send(get("/assets/logo.png")).await.unwrap_err();
        assert!(matches!(err, OriginError::Transport(_)));
    }
}
