use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CacheBackend, CacheEntry, CacheKey, CacheWriteError};

/// Process-local backend with the same replace-on-store semantics as [`super::DiskCache`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    async fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheWriteError> {
        self.entries.lock().insert(key.clone(), entry.clone());
        Ok(())
    }
}
