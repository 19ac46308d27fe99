use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, ensure};
use http::StatusCode;
use tokio::fs as async_fs;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

mod entry;
mod filename;
mod key;
mod store;
mod variation;

pub use store::PurgeStats;
pub use variation::{CacheType, Variation};

use entry::{ResponseEntry, VariationEntry};
use key::KeyComputer;
use store::{FileStore, StoreHit};

use crate::cache_control::parse_cache_control;
use crate::clock::{Clock, SystemClock};
use crate::metrics;
use crate::settings::Settings;
use crate::types::{Body, Request, Response};

pub(crate) fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    ensure!(!cancel.is_cancelled(), "cache operation cancelled");
    Ok(())
}

/// A cache hit: the reconstructed response plus the variation it was
/// matched under, with the on-disk locations retained so the caller can
/// refresh the entry without a second directory scan.
#[derive(Debug)]
pub struct CachedLookup {
    pub response: Response,
    pub variation: Variation,
    pub(crate) entry_path: PathBuf,
    pub(crate) response_path: PathBuf,
}

/// Outcome of [`ResponseCache::set_response`]: the response handed back is
/// either the stored copy (with a fresh readable body stream) or the
/// original, untouched, when it was not cacheable.
#[derive(Debug)]
pub enum StoreOutcome {
    Stored(Response),
    Uncached(Response),
}

impl StoreOutcome {
    pub fn into_response(self) -> Response {
        match self {
            StoreOutcome::Stored(response) | StoreOutcome::Uncached(response) => response,
        }
    }
}

/// The public cache surface: key computation, the two-level lookup, and
/// storage with optional variation indirection, over a file-backed store.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: Arc<FileStore>,
    keys: KeyComputer,
    clock: Arc<dyn Clock>,
    default_initial_expiration: Duration,
    default_refresh_expiration: Duration,
}

impl ResponseCache {
    /// Opens (or creates) the cache directory and starts the periodic
    /// purge task. Uses the wall clock.
    pub async fn new(settings: &Settings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Self> {
        settings.validate()?;
        let store = Arc::new(FileStore::open(settings.root.clone(), settings.max_entries).await?);
        let cache = Self {
            store: store.clone(),
            keys: KeyComputer::new(settings.require_jwt_token),
            clock: clock.clone(),
            default_initial_expiration: settings.default_initial_expiration(),
            default_refresh_expiration: settings.default_refresh_expiration(),
        };
        spawn_purge_task(store, clock, settings.purge_interval());
        Ok(cache)
    }

    /// The stable text key `request` is stored under for `variation`, or
    /// `None` when a private key is requested and no principal can be
    /// derived.
    pub fn compute_key(&self, request: &Request, variation: &Variation) -> Option<String> {
        self.keys.compute(request, variation)
    }

    /// Convenience form of [`Self::get_with_variation`] that drops the
    /// variation.
    pub async fn get_response(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Option<Response>> {
        Ok(self
            .get_with_variation(request, cancel)
            .await?
            .map(|lookup| lookup.response))
    }

    /// The two-level lookup. The entry key resolves either directly to a
    /// response (shared, no vary) or to a variation record whose payload
    /// supplies the vary rules for the second, response-key lookup.
    pub async fn get_with_variation(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Option<CachedLookup>> {
        ensure_live(cancel)?;
        let entry_key = match self.keys.compute(request, &Variation::shared_entry()) {
            Some(key) => key,
            None => return Ok(None),
        };

        let now = self.clock.now();
        match self.store.lookup(&entry_key, now).await? {
            None => {
                metrics::record_lookup(false);
                Ok(None)
            }
            Some(StoreHit::Response(hit)) => {
                let Some(response) = self.open_hit(&hit, request).await else {
                    metrics::record_lookup(false);
                    return Ok(None);
                };
                metrics::record_lookup(true);
                Ok(Some(CachedLookup {
                    response,
                    variation: Variation::shared_entry(),
                    entry_path: hit.metadata_path.clone(),
                    response_path: hit.metadata_path,
                }))
            }
            Some(StoreHit::Variation(hit)) => {
                if let Err(err) = self.store.touch(&hit.path, now) {
                    trace!(error = %err, "failed to refresh variation access time");
                }
                let variation = hit.entry.to_variation();
                let response_key = match self.keys.compute(request, &variation) {
                    Some(key) => key,
                    None => {
                        metrics::record_lookup(false);
                        return Ok(None);
                    }
                };
                ensure_live(cancel)?;
                match self.store.lookup(&response_key, now).await? {
                    Some(StoreHit::Response(response_hit)) => {
                        let Some(response) = self.open_hit(&response_hit, request).await else {
                            metrics::record_lookup(false);
                            return Ok(None);
                        };
                        metrics::record_lookup(true);
                        Ok(Some(CachedLookup {
                            response,
                            variation,
                            entry_path: hit.path,
                            response_path: response_hit.metadata_path,
                        }))
                    }
                    _ => {
                        metrics::record_lookup(false);
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn open_hit(
        &self,
        hit: &store::ResponseHit,
        request: &Request,
    ) -> Option<Response> {
        let file = match async_fs::File::open(&hit.body_path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %hit.body_path.display(),
                    "cache body unreadable; treating as miss"
                );
                return None;
            }
        };
        Some(
            hit.entry
                .to_response(Body::from_file(file), Arc::new(request.clone())),
        )
    }

    /// Classifies and stores a response. Returns [`StoreOutcome::Uncached`]
    /// with the response untouched when it is not cacheable or no key can
    /// be formed for it.
    pub async fn set_response(
        &self,
        response: Response,
        cancel: &CancellationToken,
    ) -> Result<StoreOutcome> {
        ensure_live(cancel)?;
        let variation = Variation::from_response(&response);
        if !variation.is_storable() {
            return Ok(StoreOutcome::Uncached(response));
        }
        let request = match response.request.clone() {
            Some(request) => request,
            None => return Ok(StoreOutcome::Uncached(response)),
        };
        let entry_key = match self.keys.compute(&request, &Variation::shared_entry()) {
            Some(key) => key,
            None => return Ok(StoreOutcome::Uncached(response)),
        };

        let now = self.clock.now();
        let response_cc = parse_cache_control(&response.headers);
        let expires_at = now
            + response_cc
                .max_age
                .unwrap_or(self.default_initial_expiration);
        let modified = last_modified(&response).unwrap_or(now);
        let etag = response
            .headers
            .get(http::header::ETAG)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        let url = request.uri.to_string();
        let entry = ResponseEntry::from_response(&response, &url);
        let mut response = response;

        let published = if variation.cache_type() == CacheType::Shared && !variation.has_vary() {
            self.store
                .publish_response(
                    &entry_key,
                    &entry,
                    &mut response.body,
                    modified,
                    etag.as_deref(),
                    expires_at,
                    cancel,
                )
                .await?
        } else {
            let response_key = match self.keys.compute(&request, &variation) {
                Some(key) => key,
                None => return Ok(StoreOutcome::Uncached(response)),
            };
            let published = self
                .store
                .publish_response(
                    &response_key,
                    &entry,
                    &mut response.body,
                    modified,
                    etag.as_deref(),
                    expires_at,
                    cancel,
                )
                .await?;
            let record = VariationEntry::new(&entry_key, &variation);
            self.store
                .publish_variation(
                    &entry_key,
                    &record,
                    modified,
                    etag.as_deref(),
                    expires_at,
                    cancel,
                )
                .await?;
            published
        };
        metrics::record_store();

        let file = async_fs::File::open(&published.body_path)
            .await
            .with_context(|| {
                format!(
                    "failed to reopen stored body {}",
                    published.body_path.display()
                )
            })?;
        Ok(StoreOutcome::Stored(
            entry.to_response(Body::from_file(file), request),
        ))
    }

    /// Pushes the entry's expiration out to now + the default refresh
    /// expiration.
    pub async fn refresh_response(
        &self,
        response: &Response,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expires_at = self.clock.now() + self.default_refresh_expiration;
        self.refresh_by_request(response, expires_at, cancel).await
    }

    /// Refreshes using the lifetime carried by a `304 Not Modified`
    /// revalidation response, falling back to the default refresh
    /// expiration. Passing anything but a 304 is a caller bug and fails
    /// fast.
    pub async fn refresh_response_not_modified(
        &self,
        response: &Response,
        not_modified: &Response,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure!(
            not_modified.status == StatusCode::NOT_MODIFIED,
            "refresh_response_not_modified requires a 304 response (got {})",
            not_modified.status
        );
        let max_age = parse_cache_control(&not_modified.headers).max_age;
        let expires_at = self.clock.now() + max_age.unwrap_or(self.default_refresh_expiration);
        self.refresh_by_request(response, expires_at, cancel).await
    }

    async fn refresh_by_request(
        &self,
        response: &Response,
        expires_at: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_live(cancel)?;
        let request = response
            .request
            .as_ref()
            .context("cached response has no originating request")?;
        let entry_key = match self.keys.compute(request, &Variation::shared_entry()) {
            Some(key) => key,
            None => return Ok(()),
        };

        let now = self.clock.now();
        match self.store.lookup(&entry_key, now).await? {
            None => Ok(()),
            Some(StoreHit::Response(hit)) => {
                self.store.refresh_entry(&hit.metadata_path, now, expires_at)?;
                metrics::record_refresh();
                Ok(())
            }
            Some(StoreHit::Variation(hit)) => {
                self.store.refresh_entry(&hit.path, now, expires_at)?;
                let variation = hit.entry.to_variation();
                if let Some(response_key) = self.keys.compute(request, &variation)
                    && let Some(StoreHit::Response(response_hit)) =
                        self.store.lookup(&response_key, now).await?
                {
                    self.store
                        .refresh_entry(&response_hit.metadata_path, now, expires_at)?;
                }
                metrics::record_refresh();
                Ok(())
            }
        }
    }

    /// Bumps a served hit's LRU position without extending its lifetime.
    pub(crate) fn touch(&self, lookup: &CachedLookup) -> Result<()> {
        let now = self.clock.now();
        self.store.touch(&lookup.entry_path, now)?;
        if lookup.response_path != lookup.entry_path {
            self.store.touch(&lookup.response_path, now)?;
        }
        Ok(())
    }

    /// Runs the maintenance pass on demand: capacity eviction, temp
    /// cleanup and the orphan sweep.
    pub async fn purge(&self) -> Result<PurgeStats> {
        let stats = self.store.purge(self.clock.now()).await?;
        metrics::record_purge(&stats);
        Ok(stats)
    }

    /// Empties the cache entirely.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }
}

fn spawn_purge_task(store: Arc<FileStore>, clock: Arc<dyn Clock>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge(clock.now()).await {
                Ok(stats) => {
                    metrics::record_purge(&stats);
                    trace!(
                        examined = stats.examined,
                        evicted = stats.evicted,
                        temp_removed = stats.temp_removed,
                        orphans_removed = stats.orphans_removed,
                        "cache purge completed"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "cache purge failed");
                }
            }
        }
    });
}

fn last_modified(response: &Response) -> Option<SystemTime> {
    let value = response.headers.get(http::header::LAST_MODIFIED)?;
    let value = value.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}
