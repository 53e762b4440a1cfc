use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::images::ImageFormat;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot cache an unresolved format")]
    UnresolvedFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub format: ImageFormat,
}

/// Transcoded variants on disk, one file per fingerprint named
/// `{key}.{ext}`.
///
/// Concurrent writers of the same key may both transcode and overwrite the
/// file; the content is identical so the last rename wins harmlessly.
/// With a non-zero `max_bytes` the least recently used files are evicted
/// once the directory grows past the cap.
pub struct ImageCache {
    dir: PathBuf,
    max_bytes: u64,
    tmp_counter: AtomicU64,
}

impl ImageCache {
    pub async fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            max_bytes,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str, format: ImageFormat) -> Option<PathBuf> {
        format.extension().map(|ext| self.dir.join(format!("{}.{}", key, ext)))
    }

    pub async fn check_cache(&self, key: &str) -> Option<CacheEntry> {
        for format in ImageFormat::CONCRETE {
            let Some(path) = self.entry_path(key, format) else {
                continue;
            };
            if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                touch(&path).await;
                debug!("Optimization cache hit: {}", path.display());
                return Some(CacheEntry { path, format });
            }
        }
        debug!("Optimization cache miss: {}", key);
        None
    }

    pub async fn read(&self, entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
        Ok(fs::read(&entry.path).await?)
    }

    pub async fn write_cache(&self, key: &str, bytes: &[u8], format: ImageFormat) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(key, format).ok_or(CacheError::UnresolvedFormat)?;
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Stored {} bytes in optimization cache: {}", bytes.len(), path.display());

        if self.max_bytes > 0 {
            if let Err(e) = self.enforce_limit().await {
                warn!("Optimization cache eviction failed: {}", e);
            }
        }

        Ok(path)
    }

    /// Total size of cached variants in bytes.
    pub async fn size(&self) -> Result<u64, CacheError> {
        Ok(self.entries().await?.iter().map(|(_, len, _)| len).sum())
    }

    async fn entries(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>, CacheError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_variant = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ImageFormat::CONCRETE.iter().any(|f| f.extension() == Some(ext)));
            if !is_variant {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((path, meta.len(), modified));
        }
        Ok(entries)
    }

    async fn enforce_limit(&self) -> Result<(), CacheError> {
        let mut entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum();
        if total <= self.max_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(_, _, modified)| *modified);
        let mut evicted = 0usize;
        for (path, len, _) in entries {
            if total <= self.max_bytes {
                break;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    total = total.saturating_sub(len);
                    evicted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    total = total.saturating_sub(len);
                }
                Err(e) => warn!("Failed to evict {}: {}", path.display(), e),
            }
        }

        info!("Evicted {} cached variants, cache size now {} bytes", evicted, total);
        Ok(())
    }
}

// Refreshes the modification time that eviction orders by.
async fn touch(path: &Path) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!("Failed to refresh cache entry time: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn create_test_cache(max_bytes: u64) -> (ImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ImageCache::new(temp_dir.path().join("variants"), max_bytes)
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn write_then_check_round_trips() {
        let (cache, _temp) = create_test_cache(0).await;
        let bytes = b"\x89PNG fake image bytes";

        let written = cache.write_cache("abc123", bytes, ImageFormat::Png).await.unwrap();
        let entry = cache.check_cache("abc123").await.unwrap();

        assert_eq!(entry.path, written);
        assert_eq!(entry.format, ImageFormat::Png);
        assert_eq!(std::fs::read(&entry.path).unwrap(), bytes);
        assert_eq!(cache.read(&entry).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let (cache, _temp) = create_test_cache(0).await;
        assert!(cache.check_cache("missing").await.is_none());
    }

    #[tokio::test]
    async fn overwrite_same_key() {
        let (cache, _temp) = create_test_cache(0).await;
        cache.write_cache("k", b"first", ImageFormat::Webp).await.unwrap();
        cache.write_cache("k", b"second", ImageFormat::Webp).await.unwrap();

        let entry = cache.check_cache("k").await.unwrap();
        assert_eq!(cache.read(&entry).await.unwrap(), b"second");
        assert_eq!(cache.size().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn auto_format_is_rejected() {
        let (cache, _temp) = create_test_cache(0).await;
        assert!(matches!(
            cache.write_cache("k", b"x", ImageFormat::Auto).await,
            Err(CacheError::UnresolvedFormat)
        ));
    }

    #[tokio::test]
    async fn evicts_least_recently_used_past_cap() {
        let (cache, _temp) = create_test_cache(10).await;

        cache.write_cache("old", b"123456", ImageFormat::Jpg).await.unwrap();
        let old = cache.check_cache("old").await.unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&old.path)
            .unwrap()
            .set_modified(past)
            .unwrap();

        cache.write_cache("new", b"abcdef", ImageFormat::Jpg).await.unwrap();

        assert!(cache.check_cache("old").await.is_none());
        assert!(cache.check_cache("new").await.is_some());
        assert_eq!(cache.size().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn unbounded_when_cap_is_zero() {
        let (cache, _temp) = create_test_cache(0).await;
        for i in 0..5 {
            cache.write_cache(&format!("k{}", i), &[0u8; 100], ImageFormat::Png).await.unwrap();
        }
        assert_eq!(cache.size().await.unwrap(), 500);
    }
}
