//! Persistent on-disk cache
//!
//! A small content-addressed blob store shared by all processes on the
//! machine. Entries expire by file mtime; writes go to a fresh temp name in
//! the same directory and are renamed into place, so concurrent readers see
//! either the previous value or the new one, never a torn write. No locking
//! is required.

use crate::error::{CumulusError, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Disk-backed cache with TTL semantics.
///
/// Keys are restricted to filename-safe characters so that a key maps
/// directly onto one file under the cache directory.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    dir: PathBuf,
    expiration: Duration,
}

impl PersistentCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    ///
    /// Creation is idempotent and safe to race from multiple processes.
    pub async fn new(dir: impl Into<PathBuf>, expiration: Duration) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            tokio::fs::set_permissions(&dir, perms).await?;
        }
        Ok(Self { dir, expiration })
    }

    /// Open a cache under the conventional per-user root:
    /// `~/.cache/cumulus/<provider>/<category>`.
    pub async fn open_scoped(
        provider: &str,
        category: &str,
        expiration: Duration,
    ) -> Result<Self> {
        let root = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(".cache")
            .join("cumulus");
        Self::new(root.join(provider).join(category), expiration).await
    }

    /// The cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read an entry. Returns `None` for missing or expired entries.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.entry_path(key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let age = metadata
            .modified()?
            .elapsed()
            .unwrap_or(Duration::ZERO);
        if age > self.expiration {
            debug!(key, age_secs = age.as_secs(), "cache entry expired");
            return Ok(None);
        }
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write an entry atomically: temp file in the same directory, then
    /// rename onto the key.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        let path = self.entry_path(key)?;
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let value = value.into();

        tokio::fs::write(&tmp, &value).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(FILE_MODE);
            tokio::fs::set_permissions(&tmp, perms).await?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            // Leave nothing behind on a failed rename.
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Names of all unexpired entries
    pub async fn entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            let fresh = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok())
                .map(|age| age <= self.expiration)
                .unwrap_or(false);
            if fresh {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Delete the cache directory, optionally recreating it empty
    pub async fn clear(&self, recreate: bool) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if recreate {
            tokio::fs::create_dir_all(&self.dir).await?;
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            || key.starts_with('.')
        {
            warn!(key, "rejected cache key");
            return Err(CumulusError::config(
                "cache key",
                format!("'{}' is not filename-safe", key),
            ));
        }
        Ok(self.dir.join(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn cache(expiration: Duration) -> (TempDir, PersistentCache) {
        let tmp = TempDir::new().unwrap();
        let cache = PersistentCache::new(tmp.path().join("cache"), expiration)
            .await
            .unwrap();
        (tmp, cache)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        cache.set("pkg-hash", &b"archive bytes"[..]).await.unwrap();
        let value = cache.get("pkg-hash").await.unwrap().unwrap();
        assert_eq!(&value[..], b"archive bytes");
    }

    #[tokio::test]
    async fn test_missing_key_absent() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        assert!(cache.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_absent() {
        let (_tmp, cache) = cache(Duration::from_millis(20)).await;
        cache.set("short-lived", &b"x"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("short-lived").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        cache.set("k", &b"old"[..]).await.unwrap();
        cache.set("k", &b"new"[..]).await.unwrap();
        assert_eq!(&cache.get("k").await.unwrap().unwrap()[..], b"new");
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_tear() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        let a = Bytes::from(vec![b'a'; 4096]);
        let b = Bytes::from(vec![b'b'; 4096]);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            let value = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move {
                cache.set("contended", value).await.unwrap();
                cache.get("contended").await.unwrap()
            }));
        }
        for task in tasks {
            let observed = task.await.unwrap().unwrap();
            // Either value in full, never a mix.
            assert!(observed == a || observed == b);
        }
    }

    #[tokio::test]
    async fn test_entries_lists_unexpired() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        cache.set("one", &b"1"[..]).await.unwrap();
        cache.set("two", &b"2"[..]).await.unwrap();
        let mut names = cache.entries().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_and_recreate() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        cache.set("k", &b"v"[..]).await.unwrap();
        cache.clear(true).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        // Still usable after recreation.
        cache.set("k2", &b"v2"[..]).await.unwrap();
        assert!(cache.get("k2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_keys() {
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        assert!(cache.set("../escape", &b"x"[..]).await.is_err());
        assert!(cache.set("", &b"x"[..]).await.is_err());
        assert!(cache.set("a/b", &b"x"[..]).await.is_err());
        assert!(cache.get(".tmp-123").await.is_err());
    }

    #[tokio::test]
    async fn test_construction_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        let first = PersistentCache::new(&dir, Duration::from_secs(60))
            .await
            .unwrap();
        first.set("k", &b"v"[..]).await.unwrap();
        // A second construction over the same directory preserves entries.
        let second = PersistentCache::new(&dir, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.get("k").await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (_tmp, cache) = cache(Duration::from_secs(60)).await;
        cache.set("k", &b"v"[..]).await.unwrap();

        let dir_mode = std::fs::metadata(cache.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(cache.dir().join("k"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
