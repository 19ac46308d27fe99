use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::cache::{CacheType, CachedLookup, ResponseCache, StoreOutcome};
use crate::cache_control::{parse_cache_control, request_cache_bypass};
use crate::metrics;
use crate::types::{Request, Response};

/// The transport seam below the middleware: whatever actually performs the
/// exchange with the origin.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response>;
}

#[async_trait]
impl<T: HttpSend + ?Sized> HttpSend for Arc<T> {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        (**self).send(request, cancel).await
    }
}

/// The caching middleware. On each outbound request it decides whether a
/// stored response may be served, revalidates conditionally when the
/// cached entry demands it, and stores storable origin responses on the
/// way back.
pub struct CacheMiddleware<T> {
    cache: Arc<ResponseCache>,
    next: T,
}

impl<T: HttpSend> CacheMiddleware<T> {
    pub fn new(cache: Arc<ResponseCache>, next: T) -> Self {
        Self { cache, next }
    }

    pub async fn send(
        &self,
        mut request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        request.options.set_cache_type(CacheType::None);

        let lookup_allowed = (request.method == Method::GET || request.method == Method::HEAD)
            && !request_cache_bypass(&request.headers);
        let mut hit: Option<CachedLookup> = None;
        if lookup_allowed {
            match self.cache.get_with_variation(&request, cancel).await {
                Ok(found) => hit = found,
                Err(err) => {
                    warn!(error = %err, "cache lookup failed; forwarding to origin");
                }
            }
        }

        if let Some(lookup) = hit.take() {
            let cached_cc = parse_cache_control(&lookup.response.headers);
            if cached_cc.must_revalidate {
                set_conditional_headers(&mut request, &lookup.response);
                hit = Some(lookup);
            } else if cached_cc.no_cache {
                // The entry itself demands revalidation; forward without
                // conditionals and let the store phase replace it.
                hit = Some(lookup);
            } else {
                if let Err(err) = self.cache.touch(&lookup) {
                    trace!(error = %err, "failed to refresh cache entry access time");
                }
                request.options.set_cache_type(lookup.variation.cache_type());
                let mut response = lookup.response;
                response.request = Some(Arc::new(request));
                return Ok(response);
            }
        }

        let mut origin = self.next.send(request.clone(), cancel).await?;
        if origin.request.is_none() {
            origin.request = Some(Arc::new(request.clone()));
        }

        if let Some(lookup) = hit {
            if origin.status == StatusCode::NOT_MODIFIED {
                metrics::record_revalidation(true);
                if let Err(err) = self
                    .cache
                    .refresh_response_not_modified(&lookup.response, &origin, cancel)
                    .await
                {
                    warn!(error = %err, "failed to refresh revalidated cache entry");
                }
                request.options.set_cache_type(lookup.variation.cache_type());
                let mut cached = lookup.response;
                cached.request = Some(Arc::new(request));
                return Ok(cached);
            }
            // The held cached stream is stale now that the origin answered
            // with fresh content.
            metrics::record_revalidation(false);
            drop(lookup);
        }

        match self.cache.set_response(origin, cancel).await? {
            StoreOutcome::Stored(stored) => Ok(stored),
            StoreOutcome::Uncached(origin) => Ok(origin),
        }
    }
}

#[async_trait]
impl<T: HttpSend> HttpSend for CacheMiddleware<T> {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        CacheMiddleware::send(self, request, cancel).await
    }
}

fn set_conditional_headers(request: &mut Request, cached: &Response) {
    if let Some(etag) = cached.headers.get(http::header::ETAG) {
        request
            .headers
            .insert(http::header::IF_NONE_MATCH, etag.clone());
    } else if let Some(last_modified) = cached.headers.get(http::header::LAST_MODIFIED) {
        request
            .headers
            .insert(http::header::IF_MODIFIED_SINCE, last_modified.clone());
    }
}
