use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::{CacheBackend, CacheEntry, CacheKey, CacheReadError, CacheWriteError};

/// Entry keys always contain an unescaped `_`, so temp names (a prefix plus a hyphenated
/// UUID) can never shadow a real entry.
const TEMP_PREFIX: &str = ".tmp-";

/// Temp files younger than this may belong to a store still in flight in another
/// process sharing the root.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Common `NAME_MAX` on Linux and macOS filesystems.
const MAX_FILE_NAME_BYTES: usize = 255;

/// One file per key directly under the cache root, replaced by rename on every store.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Creates the root if needed and clears temp files left behind by an interrupted
    /// process at least [`STALE_TEMP_AGE`] ago.
    pub async fn open(root: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache directory {}", root.display()))?;
        let cache = Self { root };
        let removed = cache.remove_temp_files(STALE_TEMP_AGE).await?;
        if removed > 0 {
            debug!(removed, root = %cache.root.display(), "removed stale cache temp files");
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    async fn remove_temp_files(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0usize;
        let mut entries = async_fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list cache directory {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if !is_temp {
                continue;
            }
            let old_enough = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => now
                    .duration_since(modified)
                    .map(|age| age >= older_than)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if old_enough && async_fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn read_entry(&self, path: &Path) -> Result<CacheEntry, CacheReadError> {
        let data = async_fs::read(path)
            .await
            .map_err(|source| CacheReadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        CacheEntry::decode(Bytes::from(data))
    }

    async fn write_temp(&self, temp_path: &Path, data: &[u8]) -> Result<(), CacheWriteError> {
        let write_err = |source| CacheWriteError::Write {
            path: temp_path.to_path_buf(),
            source,
        };
        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options.open(temp_path).await.map_err(write_err)?;
        file.write_all(data).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        if key.as_str().len() > MAX_FILE_NAME_BYTES {
            trace!(key = %key, "cache key exceeds file name limit");
            return None;
        }
        let path = self.entry_path(key);
        match self.read_entry(&path).await {
            Ok(entry) => Some(entry),
            Err(CacheReadError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                trace!(key = %key, "no cache entry on disk");
                None
            }
            Err(err) => {
                debug!(key = %key, error = %err, "ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheWriteError> {
        let len = key.as_str().len();
        if len > MAX_FILE_NAME_BYTES {
            return Err(CacheWriteError::KeyTooLong {
                len,
                max: MAX_FILE_NAME_BYTES,
            });
        }
        let data = entry.encode().map_err(CacheWriteError::Encode)?;
        async_fs::create_dir_all(&self.root)
            .await
            .map_err(|source| CacheWriteError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let temp_path = self.temp_path();
        if let Err(err) = self.write_temp(&temp_path, &data).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err);
        }

        let final_path = self.entry_path(key);
        if let Err(source) = async_fs::rename(&temp_path, &final_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(CacheWriteError::Rename {
                path: final_path,
                source,
            });
        }
        trace!(key = %key, bytes = data.len(), "stored cache entry");
        Ok(())
    }
}
