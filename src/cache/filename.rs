use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use filetime::FileTime;
use sha1::{Digest, Sha1};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

pub(crate) const METADATA_EXT: &str = ".response.json";
pub(crate) const BODY_EXT: &str = ".response.bin";
pub(crate) const VARIATION_EXT: &str = ".variation.json";

const UUID_LEN: usize = 36;
const TIMESTAMP_LEN: usize = 18;

/// What a cache file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Metadata,
    Body,
    Variation,
}

impl FileKind {
    pub(crate) fn extension(self) -> &'static str {
        match self {
            FileKind::Metadata => METADATA_EXT,
            FileKind::Body => BODY_EXT,
            FileKind::Variation => VARIATION_EXT,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(METADATA_EXT) {
            Some(FileKind::Metadata)
        } else if name.ends_with(BODY_EXT) {
            Some(FileKind::Body)
        } else if name.ends_with(VARIATION_EXT) {
            Some(FileKind::Variation)
        } else {
            None
        }
    }
}

/// A parsed cache file name. Permanent names embed the key hash, the
/// modification timestamp and an optional ETag hash so that the newest
/// version of a key is simply the lexicographically greatest name;
/// temporary names are UUIDs and live only under `temp/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileName {
    Permanent {
        key_hash: String,
        modified: SystemTime,
        etag_hash: Option<String>,
        kind: FileKind,
    },
    Temporary {
        id: Uuid,
        kind: FileKind,
    },
}

/// Lowercase SHA-1 hex of a cache key string.
pub(crate) fn hash_key(key: &str) -> String {
    hex::encode(Sha1::digest(key.as_bytes()))
}

/// Lowercase SHA-1 hex of an ETag header value (quoted form).
pub(crate) fn hash_etag(etag: &str) -> String {
    hex::encode(Sha1::digest(etag.as_bytes()))
}

impl FileName {
    pub(crate) fn metadata(key: &str, modified: SystemTime, etag: Option<&str>) -> Self {
        Self::permanent(key, modified, etag, FileKind::Metadata)
    }

    pub(crate) fn variation(key: &str, modified: SystemTime, etag: Option<&str>) -> Self {
        Self::permanent(key, modified, etag, FileKind::Variation)
    }

    fn permanent(key: &str, modified: SystemTime, etag: Option<&str>, kind: FileKind) -> Self {
        FileName::Permanent {
            key_hash: hash_key(key),
            modified: truncate_to_seconds(modified),
            etag_hash: etag.map(hash_etag),
            kind,
        }
    }

    pub(crate) fn temporary(kind: FileKind) -> Self {
        FileName::Temporary {
            id: Uuid::new_v4(),
            kind,
        }
    }

    /// The body file published alongside a metadata file. Only metadata
    /// names have one.
    pub(crate) fn to_body_file_name(&self) -> Result<Self> {
        match self {
            FileName::Permanent {
                key_hash,
                modified,
                etag_hash,
                kind: FileKind::Metadata,
            } => Ok(FileName::Permanent {
                key_hash: key_hash.clone(),
                modified: *modified,
                etag_hash: etag_hash.clone(),
                kind: FileKind::Body,
            }),
            FileName::Temporary {
                id,
                kind: FileKind::Metadata,
            } => Ok(FileName::Temporary {
                id: *id,
                kind: FileKind::Body,
            }),
            other => bail!("{other:?} is not a metadata file name"),
        }
    }

    pub(crate) fn kind(&self) -> FileKind {
        match self {
            FileName::Permanent { kind, .. } | FileName::Temporary { kind, .. } => *kind,
        }
    }

    pub(crate) fn key_hash(&self) -> Option<&str> {
        match self {
            FileName::Permanent { key_hash, .. } => Some(key_hash),
            FileName::Temporary { .. } => None,
        }
    }

    pub(crate) fn file_name(&self) -> String {
        match self {
            FileName::Permanent {
                key_hash,
                modified,
                etag_hash,
                kind,
            } => {
                let etag = etag_hash.as_deref().unwrap_or("");
                format!(
                    "{key_hash}_{}_{etag}{}",
                    format_timestamp(*modified),
                    kind.extension()
                )
            }
            FileName::Temporary { id, kind } => format!("{id}{}", kind.extension()),
        }
    }

    /// Parses a file name back into its parts. Names that do not match the
    /// grammar yield `None` and are skipped during enumeration.
    pub(crate) fn parse(name: &str) -> Option<Self> {
        let kind = FileKind::from_name(name)?;
        let stem_len = name.find('.')?;
        let stem = &name[..stem_len];

        if stem.len() == UUID_LEN {
            let id = Uuid::parse_str(stem).ok()?;
            return Some(FileName::Temporary { id, kind });
        }

        let (key_hash, rest) = stem.split_once('_')?;
        if key_hash.len() != 40 || !key_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let modified = parse_timestamp(rest.get(..TIMESTAMP_LEN)?)?;
        let remainder = rest.get(TIMESTAMP_LEN..)?;
        let etag_hash = remainder.strip_prefix('_').unwrap_or(remainder);
        let etag_hash = if etag_hash.is_empty() {
            None
        } else {
            Some(etag_hash.to_string())
        };

        Some(FileName::Permanent {
            key_hash: key_hash.to_string(),
            modified,
            etag_hash,
            kind,
        })
    }

    pub(crate) fn from_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }
}

/// Reads the absolute expiration instant a cache file carries in its
/// last-write time. A plain `stat` answers "is this expired?" without
/// opening the metadata.
pub(crate) fn expiration(path: &Path) -> Result<SystemTime> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat cache file {}", path.display()))?;
    metadata
        .modified()
        .with_context(|| format!("no write time for cache file {}", path.display()))
}

/// Writes a new expiration instant into the file's last-write time.
pub(crate) fn set_expiration(path: &Path, instant: SystemTime) -> Result<()> {
    filetime::set_file_mtime(path, FileTime::from_system_time(instant))
        .with_context(|| format!("failed to set expiration on {}", path.display()))
}

/// Moves the file to the front of the LRU order by touching its
/// last-access time.
pub(crate) fn refresh(path: &Path, now: SystemTime) -> Result<()> {
    filetime::set_file_atime(path, FileTime::from_system_time(now))
        .with_context(|| format!("failed to refresh access time on {}", path.display()))
}

fn truncate_to_seconds(instant: SystemTime) -> SystemTime {
    match instant.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => UNIX_EPOCH,
    }
}

fn format_timestamp(instant: SystemTime) -> String {
    let utc = OffsetDateTime::from(instant);
    format!(
        "{:04}-{:02}-{:02}T{:02}{:02}{:02}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second()
    )
}

fn parse_timestamp(value: &str) -> Option<SystemTime> {
    let bytes = value.as_bytes();
    if !value.is_ascii()
        || bytes.len() != TIMESTAMP_LEN
        || bytes[4] != b'-'
        || bytes[7] != b'-'
        || bytes[10] != b'T'
        || bytes[17] != b'Z'
    {
        return None;
    }
    let year: i32 = value[0..4].parse().ok()?;
    let month: u8 = value[5..7].parse().ok()?;
    let day: u8 = value[8..10].parse().ok()?;
    let hour: u8 = value[11..13].parse().ok()?;
    let minute: u8 = value[13..15].parse().ok()?;
    let second: u8 = value[15..17].parse().ok()?;

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time_of_day = Time::from_hms(hour, minute, second).ok()?;
    let utc = PrimitiveDateTime::new(date, time_of_day).assume_utc();
    Some(SystemTime::from(utc))
}
