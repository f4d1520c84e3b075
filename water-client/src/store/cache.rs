use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use crate::domain::UsageReading;

use super::StoreError;

/// Where the service keeps its single cached reading unless configured otherwise.
pub const DEFAULT_CACHE_PATH: &str = "/tmp/ebmud_cache.json";

/// Once per day, politely.
pub const DEFAULT_TTL: Duration = Duration::from_secs(23 * 3600);

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// File-backed cache for the most recent [`UsageReading`].
///
/// Freshness comes from the file's modification time, so an expired entry is
/// simply ignored until the next successful fetch overwrites it.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    pub fn new<P: Into<PathBuf>>(path: P, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached reading if one exists and is no older than the TTL.
    ///
    /// Missing, unreadable or undecodable files all count as a miss.
    pub async fn read(&self) -> Option<UsageReading> {
        self.read_at(SystemTime::now()).await
    }

    async fn read_at(&self, now: SystemTime) -> Option<UsageReading> {
        let modified = match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "no usable cache entry");
                return None;
            }
        };

        // mtime in the future (clock skew) counts as fresh
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > self.ttl {
            tracing::debug!(
                path = %self.path.display(),
                age_secs = age.as_secs(),
                ttl_secs = self.ttl.as_secs(),
                "cache entry expired"
            );
            return None;
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read cache entry"
                );
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(reading) => Some(reading),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding undecodable cache entry"
                );
                None
            }
        }
    }

    /// Persist `reading`, replacing whatever was cached before.
    ///
    /// The record is written to a sibling temp file and renamed into place so
    /// a concurrent reader sees either the old record or the new one.
    pub async fn write(&self, reading: &UsageReading) -> Result<(), StoreError> {
        let json = serde_json::to_vec(reading)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(self.temp_file_name());
        if let Err(e) = tokio::fs::write(&temp_path, &json).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(
            path = %self.path.display(),
            source = %reading.source,
            "cache entry written"
        );
        Ok(())
    }

    fn temp_file_name(&self) -> String {
        let base = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cache");
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        format!(".{base}.{}.{seq}.tmp", std::process::id())
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_PATH, DEFAULT_TTL)
    }
}
