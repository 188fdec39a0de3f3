//! Single-entry, file-based cache with TTL support.
//!
//! [`DiskCache`] persists the most recent successful result of an expensive
//! operation together with the time it was produced, so that a restarted
//! process can reuse it instead of recomputing it immediately.
//!
//! # Cache Location
//!
//! By default the entry lives in a platform-specific directory:
//! - Linux: `~/.cache/layerscan/inventory.json`
//! - macOS: `~/Library/Caches/layerscan/inventory.json`
//! - Windows: `%LOCALAPPDATA%\layerscan\inventory.json`
//!
//! # Freshness
//!
//! An entry produced at `t` is fresh at `now` iff `0 <= now - t < ttl`.
//! Entries stamped in the future are treated as stale.
//!
//! # Example
//!
//! ```no_run
//! use layerscan::cache::{CacheEntry, DiskCache};
//! use std::time::Duration;
//!
//! let cache = DiskCache::new("/var/cache/layerscan/inventory.json", Duration::from_secs(3 * 3600));
//! cache.store(&CacheEntry::now("node-a", vec!["openssl".to_string()])).unwrap();
//!
//! let entry = cache.load_fresh::<Vec<String>>(chrono::Utc::now());
//! assert!(entry.is_some());
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::platform::cache_dir;

/// File name of the default cache entry.
pub const DEFAULT_CACHE_FILE: &str = "inventory.json";

/// A cached value with the key it belongs to and its production time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub produced_at: DateTime<Utc>,
    pub value: T,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, produced_at: DateTime<Utc>, value: T) -> Self {
        Self {
            key: key.into(),
            produced_at,
            value,
        }
    }

    /// Creates an entry stamped with the current time.
    pub fn now(key: impl Into<String>, value: T) -> Self {
        Self::new(key, Utc::now(), value)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_fresh(self.produced_at, now, ttl)
    }
}

/// Returns true if something produced at `produced_at` is still within `ttl`
/// at `now`.
pub fn is_fresh(produced_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    // `to_std` fails on negative ages, i.e. timestamps in the future.
    (now - produced_at)
        .to_std()
        .map(|age| age < ttl)
        .unwrap_or(false)
}

/// A file holding at most one [`CacheEntry`].
///
/// Each write goes to its own uniquely named temporary file in the same
/// directory, which is then renamed over the entry. Readers and concurrent
/// writers see either a previous entry or a complete new one.
#[derive(Debug, Clone)]
pub struct DiskCache {
    path: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    /// Creates a cache backed by `path`.
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    /// Creates a cache at the default platform location.
    ///
    /// # Example
    ///
    /// ```
    /// use layerscan::cache::DiskCache;
    /// use std::time::Duration;
    ///
    /// let cache = DiskCache::with_default_path(Duration::from_secs(3600));
    /// assert!(cache.path().ends_with("inventory.json"));
    /// ```
    pub fn with_default_path(ttl: Duration) -> Self {
        Self::new(cache_dir().join(DEFAULT_CACHE_FILE), ttl)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reads the persisted entry regardless of its age.
    ///
    /// Returns `None` if there is no entry. An unreadable or corrupt entry
    /// is logged and also reported as `None`.
    pub fn load<T: DeserializeOwned>(&self) -> Option<CacheEntry<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read cache entry");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt cache entry");
                None
            }
        }
    }

    /// Reads the persisted entry if it is still fresh at `now`.
    pub fn load_fresh<T: DeserializeOwned>(&self, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
        self.load().filter(|entry: &CacheEntry<T>| entry.is_fresh(now, self.ttl))
    }

    /// Atomically replaces the persisted entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created or the
    /// entry cannot be written.
    pub fn store<T: Serialize>(&self, entry: &CacheEntry<T>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let content = serde_json::to_vec(entry).map_err(|e| Error::Parse {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".inventory-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| Error::io(dir, e))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io(&self.path, e.error))?;
        Ok(())
    }

    /// Removes the persisted entry, if any.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(3 * 3600);

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        assert!(is_fresh(now, now, TTL));
        assert!(is_fresh(now - chrono::Duration::hours(2), now, TTL));
        assert!(!is_fresh(now - chrono::Duration::hours(3), now, TTL));
        assert!(!is_fresh(now - chrono::Duration::hours(4), now, TTL));
        // Clock skew: entries from the future are not trusted.
        assert!(!is_fresh(now + chrono::Duration::minutes(5), now, TTL));
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("nested").join("inventory.json"), TTL);
        assert!(cache.load::<Vec<String>>().is_none());

        let entry = CacheEntry::now("node-a", vec!["bash".to_string(), "zlib1g".to_string()]);
        cache.store(&entry).unwrap();

        assert_eq!(cache.load::<Vec<String>>(), Some(entry.clone()));
        assert_eq!(cache.load_fresh::<Vec<String>>(Utc::now()), Some(entry));
        let leftovers = fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_store_replaces_previous_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("inventory.json"), TTL);

        cache.store(&CacheEntry::now("node-a", 1u32)).unwrap();
        cache.store(&CacheEntry::now("node-b", 2u32)).unwrap();

        let entry = cache.load::<u32>().unwrap();
        assert_eq!(entry.key, "node-b");
        assert_eq!(entry.value, 2);
    }

    #[test]
    fn test_stale_entry_not_fresh() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("inventory.json"), TTL);
        let old = Utc::now() - chrono::Duration::hours(5);
        cache.store(&CacheEntry::new("node-a", old, 1u32)).unwrap();

        assert!(cache.load::<u32>().is_some());
        assert!(cache.load_fresh::<u32>(Utc::now()).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.json");
        fs::write(&path, "{ truncated").unwrap();

        let cache = DiskCache::new(&path, TTL);
        assert!(cache.load::<u32>().is_none());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("inventory.json"), TTL);
        cache.clear().unwrap();

        cache.store(&CacheEntry::now("node-a", 1u32)).unwrap();
        cache.clear().unwrap();
        assert!(cache.load::<u32>().is_none());
    }

    #[test]
    fn test_concurrent_stores_leave_a_whole_entry() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().join("inventory.json"), TTL);

        for _ in 0..50 {
            std::thread::scope(|scope| {
                for node in ["node-0", "node-1"] {
                    let cache = &cache;
                    scope.spawn(move || {
                        let value: Vec<String> = (0..200).map(|i| format!("{}-pkg-{}", node, i)).collect();
                        cache.store(&CacheEntry::now(node, value)).unwrap();
                    });
                }
            });

            let entry = cache.load::<Vec<String>>().unwrap();
            assert!(entry.key == "node-0" || entry.key == "node-1");
            assert!(entry.value.iter().all(|v| v.starts_with(entry.key.as_str())));
        }

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
