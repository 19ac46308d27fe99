use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::Result;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::cache::CacheType;

/// Request-option key under which the middleware records how the returned
/// response relates to the cache.
pub const CACHE_TYPE_OPTION: &str = "HttpClient.Cache.CacheType";

/// Free-form per-request annotations carried alongside a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    values: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_cache_type(&mut self, cache_type: CacheType) {
        self.set(CACHE_TYPE_OPTION, cache_type.to_string());
    }

    /// The middleware's cache-type annotation, if one has been attached.
    pub fn cache_type(&self) -> Option<CacheType> {
        self.get(CACHE_TYPE_OPTION)
            .and_then(|value| value.parse().ok())
    }
}

/// An outbound HTTP request as seen by the caching middleware.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            options: RequestOptions::default(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }
}

/// An HTTP response, either fresh from the transport or reconstructed from
/// the cache. Cached responses keep the originating request attached so
/// policy decisions (method, `Authorization`) can be re-derived from them.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
    pub body: Body,
    pub request: Option<Arc<Request>>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            body: Body::empty(),
            request: None,
        }
    }

    pub fn with_request(mut self, request: Arc<Request>) -> Self {
        self.request = Some(request);
        self
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    /// The cache-type annotation on the attached request, defaulting to
    /// `None` when the middleware never touched the request.
    pub fn cache_type(&self) -> CacheType {
        self.request
            .as_ref()
            .and_then(|request| request.options.cache_type())
            .unwrap_or(CacheType::None)
    }
}

/// A response body: nothing, an in-memory buffer, or a read-only handle on
/// a cached body file. The file variant stays open for the lifetime of the
/// served response; deleting the file underneath it is tolerated.
#[derive(Debug)]
pub enum Body {
    Empty,
    Buffered(Cursor<Vec<u8>>),
    File(AsyncFile),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Body::Buffered(Cursor::new(data.into()))
    }

    pub fn from_file(file: AsyncFile) -> Self {
        Body::File(file)
    }

    /// Drains the remaining body into memory.
    pub async fn bytes(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read_to_end(&mut data).await?;
        Ok(data)
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Body::Empty => Poll::Ready(Ok(())),
            Body::Buffered(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Body::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl Unpin for Body {}
