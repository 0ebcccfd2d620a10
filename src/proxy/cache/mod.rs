use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

mod disk;
mod entry;
mod key;
mod memory;

pub use disk::DiskCache;
pub use entry::CacheEntry;
pub use key::{CacheKey, DEFAULT_RESOURCE_SUFFIX};
pub use memory::MemoryCache;

/// Storage behind the request handler. Lookups never fail loudly: anything that
/// cannot be read back as a complete entry is reported as absent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Replaces any existing entry for `key`. Readers observe either the previous
    /// entry or the complete new one, never a partial write.
    async fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheWriteError>;

    fn is_valid(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        entry.is_fresh_at(now)
    }
}

#[derive(Debug, Error)]
pub enum CacheReadError {
    #[error("failed to read cache entry {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry has no metadata line")]
    MissingMetadata,
    #[error("cache entry metadata is not valid")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("cache entry was written in unsupported format '{0}'")]
    ForeignFormat(String),
}

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("failed to create cache directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache key is {len} bytes, longer than the {max}-byte file name limit")]
    KeyTooLong { len: usize, max: usize },
    #[error("failed to encode cache entry metadata")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write cache entry {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move cache entry into place at {path}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
