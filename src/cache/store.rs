use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::ensure_live;
use super::entry::{ResponseEntry, VariationEntry};
use super::filename::{self, BODY_EXT, FileKind, FileName, METADATA_EXT};
use crate::types::Body;

const TEMP_DIR: &str = "temp";

/// The on-disk half of the cache: a flat `root/` of permanent entries plus
/// `root/temp/` for in-progress publications. Both must share a volume so
/// the final rename is atomic. There is no in-memory index; the filesystem
/// timestamps are the index (mtime = expiration, atime = LRU position) and
/// the newest version of a key is the lexicographically greatest name.
#[derive(Debug)]
pub(crate) struct FileStore {
    root: PathBuf,
    temp: PathBuf,
    max_entries: usize,
}

/// A metadata entry selected for a key, with the paths needed to serve it.
#[derive(Debug)]
pub(crate) struct ResponseHit {
    pub entry: ResponseEntry,
    pub metadata_path: PathBuf,
    pub body_path: PathBuf,
}

/// A variation record selected for a key.
#[derive(Debug)]
pub(crate) struct VariationHit {
    pub entry: VariationEntry,
    pub path: PathBuf,
}

#[derive(Debug)]
pub(crate) enum StoreHit {
    Response(Box<ResponseHit>),
    Variation(Box<VariationHit>),
}

/// Where a published response ended up. Renames that lose the publication
/// race leave the pair under `temp/`; the response is still served from
/// there and the next purge sweeps the leftovers.
#[derive(Debug)]
pub(crate) struct PublishedResponse {
    pub metadata_path: PathBuf,
    pub body_path: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub examined: usize,
    pub evicted: usize,
    pub temp_removed: usize,
    pub orphans_removed: usize,
}

impl FileStore {
    pub(crate) async fn open(root: PathBuf, max_entries: usize) -> Result<Self> {
        let temp = root.join(TEMP_DIR);
        async_fs::create_dir_all(&temp)
            .await
            .with_context(|| format!("failed to create cache directory {}", temp.display()))?;
        Ok(Self {
            root,
            temp,
            max_entries,
        })
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp
    }

    /// Looks up the newest entry stored for `key`. Expired entries are
    /// deleted on sight and reported as a miss.
    pub(crate) async fn lookup(&self, key: &str, now: SystemTime) -> Result<Option<StoreHit>> {
        let key_hash = filename::hash_key(key);
        let selected = self.newest_entry_file(&key_hash).await?;
        let (name, path) = match selected {
            Some(found) => found,
            None => return Ok(None),
        };

        let expires_at = match filename::expiration(&path) {
            Ok(instant) => instant,
            Err(err) => {
                trace!(error = %err, path = %path.display(), "cache entry vanished during lookup");
                return Ok(None);
            }
        };
        if now > expires_at {
            trace!(path = %path.display(), "cache entry expired");
            self.delete(&name, &path).await;
            return Ok(None);
        }

        match name.kind() {
            FileKind::Metadata => {
                let body_path = self.root.join(name.to_body_file_name()?.file_name());
                if async_fs::metadata(&body_path).await.is_err() {
                    warn!(
                        path = %body_path.display(),
                        "cache body missing on disk; dropping metadata"
                    );
                    self.delete(&name, &path).await;
                    return Ok(None);
                }
                let entry = match self.read_json::<ResponseEntry>(&path).await {
                    Some(entry) => entry,
                    None => {
                        self.delete(&name, &path).await;
                        return Ok(None);
                    }
                };
                Ok(Some(StoreHit::Response(Box::new(ResponseHit {
                    entry,
                    metadata_path: path,
                    body_path,
                }))))
            }
            FileKind::Variation => {
                let entry = match self.read_json::<VariationEntry>(&path).await {
                    Some(entry) => entry,
                    None => {
                        self.delete(&name, &path).await;
                        return Ok(None);
                    }
                };
                Ok(Some(StoreHit::Variation(Box::new(VariationHit {
                    entry,
                    path,
                }))))
            }
            FileKind::Body => Ok(None),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let data = match async_fs::read(path).await {
            Ok(data) => data,
            Err(err) => {
                trace!(error = %err, path = %path.display(), "failed to read cache record");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to parse cache record");
                None
            }
        }
    }

    async fn newest_entry_file(&self, key_hash: &str) -> Result<Option<(FileName, PathBuf)>> {
        let prefix = format!("{key_hash}_");
        let mut best: Option<(String, FileName, PathBuf)> = None;
        let mut saw_metadata = false;
        let mut saw_variation = false;

        let mut entries = match async_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let Some(parsed) = FileName::parse(name) else {
                trace!(file = name, "skipping cache file with unrecognized name");
                continue;
            };
            match parsed.kind() {
                FileKind::Metadata => saw_metadata = true,
                FileKind::Variation => saw_variation = true,
                FileKind::Body => continue,
            }
            let is_newer = best
                .as_ref()
                .map(|(best_name, _, _)| name > best_name.as_str())
                .unwrap_or(true);
            if is_newer {
                best = Some((name.to_string(), parsed, entry.path()));
            }
        }

        if saw_metadata && saw_variation {
            // Steady state holds at most one record kind per key hash; the
            // newest name wins if that is ever violated.
            warn!(key_hash, "metadata and variation records coexist for one key hash");
        }
        Ok(best.map(|(_, name, path)| (name, path)))
    }

    /// Streams a response body plus its metadata into `temp/` and renames
    /// both into `root/`, body first so any observer that can see the
    /// metadata can open the body.
    pub(crate) async fn publish_response(
        &self,
        key: &str,
        entry: &ResponseEntry,
        body: &mut Body,
        modified: SystemTime,
        etag: Option<&str>,
        expires_at: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<PublishedResponse> {
        ensure_live(cancel)?;
        let metadata_name = FileName::metadata(key, modified, etag);
        let body_name = metadata_name.to_body_file_name()?;
        let temp_metadata_name = FileName::temporary(FileKind::Metadata);
        let temp_body_name = temp_metadata_name.to_body_file_name()?;
        let temp_metadata_path = self.temp.join(temp_metadata_name.file_name());
        let temp_body_path = self.temp.join(temp_body_name.file_name());

        let mut file = async_fs::File::create(&temp_body_path)
            .await
            .with_context(|| format!("failed to create {}", temp_body_path.display()))?;
        tokio::io::copy(body, &mut file)
            .await
            .context("failed to stream response body into the cache")?;
        file.flush().await?;
        drop(file);

        ensure_live(cancel)?;
        let data = serde_json::to_vec(entry)?;
        let metadata_written = async_fs::write(&temp_metadata_path, &data)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|()| filename::set_expiration(&temp_metadata_path, expires_at));
        if let Err(err) = metadata_written {
            // The body already streamed to temp; serve from there and let
            // the next purge sweep the unpublished pair.
            warn!(
                error = %err,
                path = %temp_metadata_path.display(),
                "cache metadata write failed; entry stays unpublished"
            );
            return Ok(PublishedResponse {
                metadata_path: temp_metadata_path,
                body_path: temp_body_path,
            });
        }

        let final_body_path = self.root.join(body_name.file_name());
        let final_metadata_path = self.root.join(metadata_name.file_name());
        if let Err(err) = async_fs::rename(&temp_body_path, &final_body_path).await {
            warn!(
                error = %err,
                path = %final_body_path.display(),
                "cache body rename failed; serving from temp until the next purge"
            );
            return Ok(PublishedResponse {
                metadata_path: temp_metadata_path,
                body_path: temp_body_path,
            });
        }
        if let Err(err) = async_fs::rename(&temp_metadata_path, &final_metadata_path).await {
            warn!(
                error = %err,
                path = %final_metadata_path.display(),
                "cache metadata rename failed; entry stays unpublished"
            );
            return Ok(PublishedResponse {
                metadata_path: temp_metadata_path,
                body_path: final_body_path,
            });
        }
        trace!(path = %final_metadata_path.display(), "published cache entry");
        Ok(PublishedResponse {
            metadata_path: final_metadata_path,
            body_path: final_body_path,
        })
    }

    /// Publishes a variation record with the same temp-then-rename
    /// protocol as responses.
    pub(crate) async fn publish_variation(
        &self,
        key: &str,
        entry: &VariationEntry,
        modified: SystemTime,
        etag: Option<&str>,
        expires_at: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        ensure_live(cancel)?;
        let name = FileName::variation(key, modified, etag);
        let temp_name = FileName::temporary(FileKind::Variation);
        let temp_path = self.temp.join(temp_name.file_name());

        let data = serde_json::to_vec(entry)?;
        async_fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        filename::set_expiration(&temp_path, expires_at)?;

        let final_path = self.root.join(name.file_name());
        if let Err(err) = async_fs::rename(&temp_path, &final_path).await {
            warn!(
                error = %err,
                path = %final_path.display(),
                "variation rename failed; record stays unpublished"
            );
            return Ok(temp_path);
        }
        Ok(final_path)
    }

    /// Applies a new expiration and a fresh LRU position. No file move.
    pub(crate) fn refresh_entry(
        &self,
        path: &Path,
        now: SystemTime,
        expires_at: SystemTime,
    ) -> Result<()> {
        filename::refresh(path, now)?;
        filename::set_expiration(path, expires_at)
    }

    /// Bumps the LRU position only; the expiration stays as it is.
    pub(crate) fn touch(&self, path: &Path, now: SystemTime) -> Result<()> {
        filename::refresh(path, now)
    }

    /// Deletes an entry: metadata first, then the body. Body removal
    /// failures are tolerated; the orphan sweep catches up later.
    pub(crate) async fn delete(&self, name: &FileName, metadata_path: &Path) {
        if let Err(err) = async_fs::remove_file(metadata_path).await
            && err.kind() != ErrorKind::NotFound
        {
            trace!(error = %err, path = %metadata_path.display(), "failed to remove cache record");
        }
        if name.kind() == FileKind::Metadata
            && let Ok(body_name) = name.to_body_file_name()
        {
            let body_path = self.root.join(body_name.file_name());
            if let Err(err) = async_fs::remove_file(&body_path).await
                && err.kind() != ErrorKind::NotFound
            {
                trace!(
                    error = %err,
                    path = %body_path.display(),
                    "failed to remove cache body; orphan sweep will retry"
                );
            }
        }
    }

    /// Capacity enforcement and crash cleanup: evicts the least recently
    /// used entries beyond `max_entries`, empties `temp/`, and unlinks
    /// body files whose metadata is gone.
    pub(crate) async fn purge(&self, _now: SystemTime) -> Result<PurgeStats> {
        let mut stats = PurgeStats::default();

        let mut records: Vec<(SystemTime, FileName, PathBuf)> = Vec::new();
        let mut bodies: Vec<(String, PathBuf)> = Vec::new();
        let mut entries = match async_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(stats),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            let Some(parsed) = FileName::parse(name) else {
                trace!(file = name, "skipping cache file with unrecognized name");
                continue;
            };
            match parsed.kind() {
                FileKind::Metadata | FileKind::Variation => {
                    stats.examined += 1;
                    let accessed = entry
                        .metadata()
                        .await
                        .ok()
                        .and_then(|metadata| metadata.accessed().ok())
                        .unwrap_or(UNIX_EPOCH);
                    records.push((accessed, parsed, entry.path()));
                }
                FileKind::Body => bodies.push((name.to_string(), entry.path())),
            }
        }

        records.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, name, path) in records.iter().skip(self.max_entries) {
            self.delete(name, path).await;
            stats.evicted += 1;
        }

        stats.temp_removed = self.clear_temp().await?;

        let survivors: HashSet<&str> = records
            .iter()
            .take(self.max_entries)
            .filter(|(_, name, _)| name.kind() == FileKind::Metadata)
            .filter_map(|(_, _, path)| path.file_name()?.to_str()?.strip_suffix(METADATA_EXT))
            .collect();
        for (name, path) in &bodies {
            let Some(stem) = name.strip_suffix(BODY_EXT) else {
                continue;
            };
            if survivors.contains(stem) {
                continue;
            }
            match async_fs::remove_file(path).await {
                Ok(()) => stats.orphans_removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    trace!(error = %err, path = %path.display(), "failed to remove orphaned body");
                }
            }
        }

        Ok(stats)
    }

    async fn clear_temp(&self) -> Result<usize> {
        let mut removed = 0usize;
        let mut entries = match async_fs::read_dir(&self.temp).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            match async_fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    trace!(error = %err, path = %entry.path().display(), "failed to remove temp file");
                }
            }
        }
        Ok(removed)
    }

    /// Removes every record and every body, leaving an empty cache.
    pub(crate) async fn clear(&self) -> Result<()> {
        let mut entries = match async_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut leftover_bodies = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            let Some(parsed) = FileName::parse(name) else {
                continue;
            };
            match parsed.kind() {
                FileKind::Metadata | FileKind::Variation => {
                    self.delete(&parsed, &entry.path()).await;
                }
                FileKind::Body => leftover_bodies.push(entry.path()),
            }
        }
        for path in leftover_bodies {
            if let Err(err) = async_fs::remove_file(&path).await
                && err.kind() != ErrorKind::NotFound
            {
                trace!(error = %err, path = %path.display(), "failed to remove orphaned body");
            }
        }
        self.clear_temp().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry_for(url: &str) -> ResponseEntry {
        ResponseEntry {
            url: url.to_string(),
            version: "1.1".to_string(),
            status_code: 200,
            reason_phrase: "OK".to_string(),
            response_headers: Vec::new(),
            content_headers: Vec::new(),
            trailing_headers: Vec::new(),
        }
    }

    async fn publish(
        store: &FileStore,
        key: &str,
        body: &[u8],
        modified: SystemTime,
        ttl: Duration,
    ) -> Result<PublishedResponse> {
        let mut body = Body::from_bytes(body.to_vec());
        store
            .publish_response(
                key,
                &entry_for("https://example.com/"),
                &mut body,
                modified,
                None,
                modified + ttl,
                &CancellationToken::new(),
            )
            .await
    }

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[tokio::test]
    async fn publish_then_lookup_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let published = publish(&store, "k1", b"payload", now(), Duration::from_secs(60)).await?;
        assert!(published.metadata_path.starts_with(store.root()));

        let hit = store.lookup("k1", now()).await?.expect("expected a hit");
        match hit {
            StoreHit::Response(hit) => {
                assert_eq!(hit.entry.status_code, 200);
                let body = async_fs::read(&hit.body_path).await?;
                assert_eq!(body, b"payload");
            }
            other => panic!("expected response hit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_miss_and_are_deleted() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let stored_at = now() - Duration::from_secs(120);
        let published = publish(&store, "k1", b"old", stored_at, Duration::from_secs(60)).await?;
        assert!(published.metadata_path.exists());

        assert!(store.lookup("k1", now()).await?.is_none());
        assert!(!published.metadata_path.exists());
        assert!(!published.body_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn newest_modified_timestamp_wins() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let base = now();
        let mut old_body = Body::from_bytes(b"old".to_vec());
        let mut entry = entry_for("https://example.com/");
        entry.reason_phrase = "old".to_string();
        store
            .publish_response(
                "k1",
                &entry,
                &mut old_body,
                base - Duration::from_secs(10),
                None,
                base + Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await?;

        let mut new_body = Body::from_bytes(b"new".to_vec());
        entry.reason_phrase = "new".to_string();
        store
            .publish_response(
                "k1",
                &entry,
                &mut new_body,
                base,
                None,
                base + Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await?;

        let hit = store.lookup("k1", base).await?.expect("expected a hit");
        match hit {
            StoreHit::Response(hit) => assert_eq!(hit.entry.reason_phrase, "new"),
            other => panic!("expected response hit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_body_invalidates_metadata() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let published = publish(&store, "k1", b"x", now(), Duration::from_secs(60)).await?;
        async_fs::remove_file(&published.body_path).await?;

        assert!(store.lookup("k1", now()).await?.is_none());
        assert!(!published.metadata_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn variation_records_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let variation = crate::cache::Variation::new(
            crate::cache::CacheType::Shared,
            vec!["accept-language".to_string()],
        );
        let record = VariationEntry::new("k1", &variation);
        store
            .publish_variation(
                "k1",
                &record,
                now(),
                None,
                now() + Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await?;

        match store.lookup("k1", now()).await? {
            Some(StoreHit::Variation(hit)) => {
                assert_eq!(hit.entry.to_variation(), variation);
            }
            other => panic!("expected variation hit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn purge_enforces_capacity_and_cleans_temp_and_orphans() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 2).await?;

        let base = now();
        for (index, key) in ["a", "b", "c", "d"].iter().enumerate() {
            let published = publish(&store, key, b"x", base, Duration::from_secs(300)).await?;
            // Spread the LRU order out; later keys are fresher.
            filename::refresh(
                &published.metadata_path,
                base + Duration::from_secs(index as u64 + 1),
            )?;
        }

        // A straggler in temp and an orphaned body in root.
        let temp_leftover = store.temp_dir().join(
            FileName::temporary(FileKind::Body).file_name(),
        );
        async_fs::write(&temp_leftover, b"junk").await?;
        let orphan = store.root().join(
            FileName::metadata("orphan", base, None)
                .to_body_file_name()?
                .file_name(),
        );
        async_fs::write(&orphan, b"junk").await?;

        let stats = store.purge(now()).await?;
        assert_eq!(stats.evicted, 2);
        assert!(stats.temp_removed >= 1);
        assert!(stats.orphans_removed >= 1);
        assert!(!temp_leftover.exists());
        assert!(!orphan.exists());

        // The two most recently used entries survive.
        assert!(store.lookup("c", now()).await?.is_some());
        assert!(store.lookup("d", now()).await?.is_some());
        assert!(store.lookup("a", now()).await?.is_none());
        assert!(store.lookup("b", now()).await?.is_none());

        let mut json_count = 0usize;
        let mut entries = async_fs::read_dir(store.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && entry.file_name().to_string_lossy().ends_with(".json")
            {
                json_count += 1;
            }
        }
        assert!(json_count <= 2, "purge must enforce the soft entry limit");
        Ok(())
    }

    #[tokio::test]
    async fn clear_leaves_an_empty_cache() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        publish(&store, "a", b"x", now(), Duration::from_secs(60)).await?;
        publish(&store, "b", b"y", now(), Duration::from_secs(60)).await?;

        store.clear().await?;

        let mut entries = async_fs::read_dir(store.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            assert!(
                entry.file_type().await?.is_dir(),
                "unexpected file {} after clear",
                entry.path().display()
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_publication_leaves_only_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileStore::open(dir.path().to_path_buf(), 16).await?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut body = Body::from_bytes(b"x".to_vec());
        let result = store
            .publish_response(
                "k1",
                &entry_for("https://example.com/"),
                &mut body,
                now(),
                None,
                now() + Duration::from_secs(60),
                &cancel,
            )
            .await;
        assert!(result.is_err());
        assert!(store.lookup("k1", now()).await?.is_none());
        Ok(())
    }
}
