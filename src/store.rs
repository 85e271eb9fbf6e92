//! Cache store collaborator
//!
//! The engine persists encoded [`CachedEntity`](crate::codec::CachedEntity)
//! blobs through the byte-addressable, TTL-aware [`CacheStore`] trait.
//! [`MemoryStore`] is the in-process implementation used by the binary.

use crate::error::{DeltaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Byte-addressable key/value store with per-entry TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the bytes stored under `key`, `None` when missing or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Whether a live entry exists for `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drop the entry for `key`; returns whether one was present
    async fn remove(&self, key: &str) -> Result<bool>;
}

#[derive(Clone)]
struct StoreEntry {
    data: Bytes,
    expires_at: SystemTime,
    last_accessed: SystemTime,
}

/// Store statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-memory [`CacheStore`] with TTL expiry and an optional LRU size cap
pub struct MemoryStore {
    storage: Arc<RwLock<HashMap<String, StoreEntry>>>,
    max_size_bytes: Option<usize>,
    current_size_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            storage: Arc::new(RwLock::new(HashMap::new())),
            max_size_bytes: None,
            current_size_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a store that evicts least recently used entries past `max_size_bytes`
    pub fn with_max_size(max_size_bytes: usize) -> Self {
        MemoryStore {
            max_size_bytes: Some(max_size_bytes),
            ..Self::new()
        }
    }

    pub fn get_stats(&self) -> StoreStats {
        let total_entries = self.storage.read().map(|s| s.len()).unwrap_or(0);
        StoreStats {
            total_entries,
            total_bytes: self.current_size_bytes.load(Ordering::Relaxed) as usize,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lock_error<E: std::fmt::Debug>(e: E) -> DeltaError {
        DeltaError::CacheUnavailable(format!("store lock poisoned: {:?}", e))
    }

    fn release_bytes(&self, bytes: usize) {
        let _ = self
            .current_size_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes as u64))
            });
    }

    /// Drop expired entries
    fn cleanup_expired(&self, storage: &mut HashMap<String, StoreEntry>) {
        let now = SystemTime::now();
        let mut removed_bytes = 0;
        storage.retain(|_, entry| {
            if entry.expires_at <= now {
                removed_bytes += entry.data.len();
                false
            } else {
                true
            }
        });
        if removed_bytes > 0 {
            debug!("Expired entries cleaned up: freed_bytes={}", removed_bytes);
            self.release_bytes(removed_bytes);
        }
    }

    /// Evict least recently used entries until `needed_bytes` fit under the cap
    fn evict_lru(&self, storage: &mut HashMap<String, StoreEntry>, needed_bytes: usize, max_size: usize) {
        let mut entries: Vec<_> = storage
            .iter()
            .map(|(k, v)| (k.clone(), v.last_accessed))
            .collect();
        entries.sort_by_key(|(_, last_accessed)| *last_accessed);

        let mut evicted = 0;
        for (key, _) in entries {
            let current = self.current_size_bytes.load(Ordering::Relaxed) as usize;
            if current + needed_bytes <= max_size {
                break;
            }
            if let Some(entry) = storage.remove(&key) {
                self.release_bytes(entry.data.len());
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!("LRU eviction: removed {} entries, {} remain", evicted, storage.len());
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = SystemTime::now();
        let mut storage = self.storage.write().map_err(Self::lock_error)?;

        let result = match storage.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                Some(entry.data.clone())
            }
            Some(_) => {
                debug!("Cache entry expired: key={}", key);
                if let Some(expired) = storage.remove(key) {
                    self.release_bytes(expired.data.len());
                }
                None
            }
            None => None,
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let now = SystemTime::now();
        let data_size = value.len();
        let mut storage = self.storage.write().map_err(Self::lock_error)?;

        if let Some(old) = storage.remove(key) {
            self.release_bytes(old.data.len());
        }

        if let Some(max_size) = self.max_size_bytes {
            if data_size > max_size {
                warn!(
                    "Entry larger than store capacity, not stored: key={}, size={}, max={}",
                    key, data_size, max_size
                );
                return Ok(());
            }
            let current = self.current_size_bytes.load(Ordering::Relaxed) as usize;
            if current + data_size > max_size {
                debug!("Store size limit reached ({}/{}), evicting LRU entries", current, max_size);
                self.evict_lru(&mut storage, data_size, max_size);
            }
        }

        storage.insert(
            key.to_string(),
            StoreEntry {
                data: value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
        self.current_size_bytes.fetch_add(data_size as u64, Ordering::Relaxed);
        debug!("Stored entry: key={}, size={}, ttl={:?}", key, data_size, ttl);

        if storage.len() % 100 == 0 {
            self.cleanup_expired(&mut storage);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let storage = self.storage.read().map_err(Self::lock_error)?;
        Ok(storage
            .get(key)
            .map(|e| e.expires_at > SystemTime::now())
            .unwrap_or(false))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut storage = self.storage.write().map_err(Self::lock_error)?;
        match storage.remove(key) {
            Some(entry) => {
                self.release_bytes(entry.data.len());
                debug!("Removed entry: key={}", key);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
