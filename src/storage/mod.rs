//! Object storage for captured artifacts.
//!
//! Remote persistence goes through the [`ObjectStore`] trait; the
//! production implementation is the HTTP client in [`http`]. A small
//! file-backed [`LocalCache`] holds artifacts until their upload
//! succeeds, and doubles as the usage source for the quota probe.

mod http;

pub use http::HttpObjectStore;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of captured artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Screenshot,
    Video,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Video => "video",
        }
    }

    /// Metadata table for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshots",
            ArtifactKind::Video => "recordings",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "image/jpeg",
            ArtifactKind::Video => "video/webm",
        }
    }
}

/// A captured screenshot or video clip awaiting upload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub owner_id: String,
    pub kind: ArtifactKind,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(owner_id: &str, kind: ArtifactKind, payload: Vec<u8>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            kind,
            payload,
            captured_at: Utc::now(),
        }
    }

    fn timestamp(&self) -> String {
        self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Remote path, `{owner}/{kind}/{isoTimestamp}`.
    pub fn object_path(&self) -> String {
        format!("{}/{}/{}", self.owner_id, self.kind.as_str(), self.timestamp())
    }

    /// Local cache key, `{kind}_{owner}_{isoTimestamp}`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}_{}", self.kind.as_str(), self.owner_id, self.timestamp())
    }
}

/// A remote object listing entry.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub path: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Remote artifact storage.
///
/// Implementations clone whatever they need into the returned future so
/// callers can drive uploads from detached tasks.
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `bytes` under `path`, returning the remote reference.
    fn put(
        &self,
        path: String,
        bytes: Vec<u8>,
        content_type: &'static str,
    ) -> BoxFuture<'static, Result<String, StorageError>>;

    /// List objects under `prefix`.
    fn list(&self, prefix: String) -> BoxFuture<'static, Result<Vec<RemoteObject>, StorageError>>;

    /// Remove the given objects.
    fn remove(&self, paths: Vec<String>) -> BoxFuture<'static, Result<(), StorageError>>;
}

/// File-backed cache of artifacts that have not been uploaded yet.
///
/// Entries are removed on upload success; anything left behind ages out
/// through the janitor's retention pass.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Cache keys carry RFC 3339 timestamps; ':' is not portable in
        // file names.
        self.dir.join(key.replace([':', '/'], "-"))
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        fs::write(self.path_for(key), bytes)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Remove cached files whose modification time is before `cutoff`.
    ///
    /// Returns how many files were removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let md = entry.metadata()?;
            if !md.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = md.modified()?.into();
            if modified < cutoff {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Total bytes currently cached.
    pub fn total_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let md = entry.metadata()?;
            if md.is_file() {
                total += md.len();
            }
        }
        Ok(total)
    }
}

/// Storage usage estimate from the host.
#[derive(Debug, Clone, Copy)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: Option<u64>,
}

/// Optional host capability reporting storage usage.
///
/// `None` means the capability is unavailable; callers fail open.
pub trait QuotaProbe: Send + Sync + 'static {
    fn estimate(&self) -> Option<StorageEstimate>;
}

/// Quota probe backed by the local artifact cache directory.
pub struct CacheQuotaProbe {
    cache: LocalCache,
}

impl CacheQuotaProbe {
    pub fn new(cache: LocalCache) -> Self {
        Self { cache }
    }
}

impl QuotaProbe for CacheQuotaProbe {
    fn estimate(&self) -> Option<StorageEstimate> {
        let usage = self.cache.total_bytes().ok()?;
        Some(StorageEstimate { usage, quota: None })
    }
}
