use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde_json::Value;

use crate::{Cache, CacheEntry, CacheError, Clock, SystemClock, digest};

/// Process-local cache. Every operation runs under a single lock, so a get,
/// put or sweep is one atomic unit and concurrent writers resolve as last
/// writer wins.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Cache for MemoryCache {
    fn get(&self, text: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = digest(text);
        let now = self.clock.now();
        let mut entries = self.entries.write();

        match entries.get_mut(&key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                log::debug!("cache hit for {} (hits: {})", key, entry.hit_count);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    fn put(&self, text: &str, payload: Value, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(text, payload, self.clock.now(), ttl)?;

        self.entries.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn sweep_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));

        Ok(before - entries.len())
    }

    fn peek(&self, text: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(&digest(text)).cloned())
    }
}
