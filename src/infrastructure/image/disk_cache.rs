//! Disk-based image cache for persistence across sessions.
//!
//! All calls block on file I/O. `ImageCache` moves writes onto its I/O worker.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::WebImageError;

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

const FILE_EXTENSION: &str = "img";

/// Disk-based image cache that persists raw image bytes, one file per key.
pub struct DiskImageCache {
    name: String,
    cache_dir: PathBuf,
    max_size: u64,
    current_size: AtomicU64,
    item_count: AtomicUsize,
}

impl DiskImageCache {
    /// Creates a new disk cache in the specified directory.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created or read.
    pub fn new(cache_dir: PathBuf, max_size: u64) -> Result<Self, WebImageError> {
        fs::create_dir_all(&cache_dir)
            .map_err(|e| WebImageError::io(format!("Failed to create cache dir: {e}")))?;

        let mut total_size = 0u64;
        let mut count = 0usize;
        let entries = fs::read_dir(&cache_dir)
            .map_err(|e| WebImageError::io(format!("Failed to read cache dir: {e}")))?;
        for entry in entries.flatten() {
            if is_cache_file(&entry.path())
                && let Ok(meta) = entry.metadata()
            {
                total_size += meta.len();
                count += 1;
            }
        }

        let name = cache_dir
            .file_name()
            .map_or_else(|| "disk".to_owned(), |n| n.to_string_lossy().into_owned());

        let cache = Self {
            name,
            cache_dir,
            max_size,
            current_size: AtomicU64::new(total_size),
            item_count: AtomicUsize::new(count),
        };

        cache.cleanup_if_needed();
        Ok(cache)
    }

    /// Cache name, derived from the directory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.cache_dir
    }

    /// Configured size limit in bytes.
    #[must_use]
    pub const fn size_limit(&self) -> u64 {
        self.max_size
    }

    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Reads raw bytes for a key.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.cache_path(key);
        match fs::read(&path) {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                touch(&path);
                Some(Bytes::from(bytes))
            }
            Err(_) => {
                trace!(key = %key, "Disk cache miss");
                None
            }
        }
    }

    /// Stores raw bytes for a key, replacing any previous file.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub fn set(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), WebImageError> {
        let path = self.cache_path(key);
        let old_size = fs::metadata(&path).map(|m| m.len()).ok();

        let mut file = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .map_err(|e| WebImageError::io(format!("Failed to create cache file: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| WebImageError::io(format!("Failed to write cache file: {e}")))?;
        file.persist(&path)
            .map_err(|e| WebImageError::io(format!("Failed to persist cache file: {}", e.error)))?;

        let new_size = bytes.len() as u64;
        if let Some(old) = old_size {
            if new_size > old {
                self.current_size.fetch_add(new_size - old, Ordering::Relaxed);
            } else {
                self.current_size.fetch_sub(old - new_size, Ordering::Relaxed);
            }
        } else {
            self.current_size.fetch_add(new_size, Ordering::Relaxed);
            self.item_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");

        self.cleanup_if_needed();
        Ok(())
    }

    /// Removes the file for a key.
    pub fn remove(&self, key: &CacheKey) {
        let path = self.cache_path(key);
        let size = fs::metadata(&path).map(|m| m.len()).ok();
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %key, error = %e, "Failed to remove from disk cache");
            }
        } else if let Some(s) = size {
            self.current_size.fetch_sub(s, Ordering::Relaxed);
            self.item_count.fetch_sub(1, Ordering::Relaxed);
            debug!(key = %key, "Removed from disk cache");
        }
    }

    /// Checks if a key is cached.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache_path(key).is_file()
    }

    /// Clears the entire disk cache.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be read.
    pub fn clear(&self) -> Result<(), WebImageError> {
        let entries = fs::read_dir(&self.cache_dir)
            .map_err(|e| WebImageError::io(format!("Failed to read cache dir: {e}")))?;

        for entry in entries {
            let path = entry
                .map_err(|e| WebImageError::io(format!("Failed to read entry: {e}")))?
                .path();
            if is_cache_file(&path) && fs::remove_file(&path).is_err() {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }
        self.current_size.store(0, Ordering::Relaxed);
        self.item_count.store(0, Ordering::Relaxed);
        debug!(cache = %self.name, "Cleared disk cache");
        Ok(())
    }

    /// Returns the current cache size in bytes.
    pub fn total_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Returns the number of cached files.
    pub fn total_count(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Removes least recently accessed files when over the size limit.
    fn cleanup_if_needed(&self) {
        let current_size = self.total_size();
        if current_size <= self.max_size {
            return;
        }

        debug!(
            current_size = current_size,
            max_size = self.max_size,
            "Disk cache over limit, cleaning up"
        );

        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return;
        };

        let mut files: Vec<(PathBuf, SystemTime, u64)> = entries
            .flatten()
            .filter(|entry| is_cache_file(&entry.path()))
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                let accessed = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Some((entry.path(), accessed, meta.len()))
            })
            .collect();

        files.sort_by_key(|(_, time, _)| *time);

        let mut freed_size = 0u64;
        let mut freed_count = 0usize;
        let target = current_size - self.max_size + (self.max_size / 10);

        for (path, _, size) in files {
            if freed_size >= target {
                break;
            }

            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
            } else {
                trace!(path = %path.display(), "Removed old cache file");
                freed_size += size;
                freed_count += 1;
            }
        }
        self.current_size.fetch_sub(freed_size, Ordering::Relaxed);
        self.item_count.fetch_sub(freed_count, Ordering::Relaxed);

        debug!(
            freed_size = freed_size,
            freed_count = freed_count,
            "Disk cache cleanup complete"
        );
    }
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == FILE_EXTENSION)
}

/// Bumps access and modification times so eviction sees recent reads.
fn touch(path: &Path) {
    let now = SystemTime::now();
    if let Ok(file) = fs::File::options().write(true).open(path) {
        let _ = file.set_times(fs::FileTimes::new().set_accessed(now).set_modified(now));
    }
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_path() -> PathBuf {
    directories::ProjectDirs::from("com", "linuxmobile", "lsimage").map_or_else(
        || {
            std::env::temp_dir()
                .join("lsimage")
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}
