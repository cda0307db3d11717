use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use cache::{Cache, CacheEntry, CacheError, Clock, digest};
use chrono::NaiveDateTime;
use heed::{
    Database, Env, EnvOpenOptions, MdbError,
    types::{SerdeJson, Str},
};
use parking_lot::RwLock;
use serde_json::Value;

const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;

/// Expired keys deleted per write transaction during a sweep. Small batches
/// keep each transaction within the few pages a nearly full map has left.
const SWEEP_BATCH: usize = 8;

/// LMDB-backed cache keyed by the query digest.
///
/// Each get, put and sweep batch runs inside a single write transaction.
/// LMDB admits one writer at a time, which makes them atomic with respect to
/// each other.
pub struct LocalCache {
    env: Env,
    storage: Database<Str, SerdeJson<CacheEntry>>,
    clock: Arc<dyn Clock>,
    /// Current map size. Transactions hold the read side; resizing the map
    /// requires that none are open, so it takes the write side.
    map_size: RwLock<usize>,
}

fn is_map_full(err: &heed::Error) -> bool {
    matches!(err, heed::Error::Mdb(MdbError::MapFull))
}

impl LocalCache {
    pub fn new<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_map_size(path, clock, DEFAULT_MAP_SIZE)
    }

    pub fn with_map_size<P: AsRef<Path>>(
        path: P,
        clock: Arc<dyn Clock>,
        map_size: usize,
    ) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path.as_ref())?
        };

        let mut wtxn = env.write_txn()?;
        let storage = env.create_database(&mut wtxn, Some("query_cache"))?;
        wtxn.commit()?;

        Ok(LocalCache {
            env,
            storage,
            clock,
            map_size: RwLock::new(map_size),
        })
    }

    fn write_entry(&self, entry: &CacheEntry) -> heed::Result<()> {
        let _map = self.map_size.read();
        let mut wtxn = self.env.write_txn()?;
        self.storage.delete(&mut wtxn, &entry.key)?;
        self.storage.put(&mut wtxn, &entry.key, entry)?;
        wtxn.commit()
    }

    fn expired_keys(&self, now: NaiveDateTime) -> heed::Result<Vec<String>> {
        let _map = self.map_size.read();
        let rtxn = self.env.read_txn()?;

        let mut keys = Vec::new();
        for item in self.storage.iter(&rtxn)? {
            let (key, entry) = item?;
            if entry.is_expired(now) {
                keys.push(key.to_owned());
            }
        }
        Ok(keys)
    }

    fn delete_batch(&self, keys: &[String]) -> heed::Result<()> {
        let _map = self.map_size.read();
        let mut wtxn = self.env.write_txn()?;
        for key in keys {
            self.storage.delete(&mut wtxn, key)?;
        }
        wtxn.commit()
    }

    /// Doubles the map so that a sweep of a completely full map can still
    /// copy the pages it deletes from.
    fn grow(&self) -> heed::Result<()> {
        let mut map_size = self.map_size.write();
        let grown = map_size.saturating_mul(2);

        // SAFETY: holding the write side guarantees no transaction of this
        // cache is open.
        unsafe { self.env.resize(grown)? };

        log::warn!(
            "cache map is full, grew it from {} to {} bytes",
            *map_size,
            grown
        );
        *map_size = grown;
        Ok(())
    }
}

impl Cache for LocalCache {
    fn get(&self, text: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = digest(text);
        let now = self.clock.now();
        let _map = self.map_size.read();
        let mut wtxn = self.env.write_txn().map_err(CacheError::unavailable)?;

        let Some(mut entry) = self
            .storage
            .get(&wtxn, &key)
            .map_err(CacheError::unavailable)?
        else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            return Ok(None);
        }

        entry.hit_count += 1;
        self.storage
            .put(&mut wtxn, &key, &entry)
            .map_err(CacheError::unavailable)?;
        wtxn.commit().map_err(CacheError::unavailable)?;

        log::debug!("cache hit for {} (hits: {})", key, entry.hit_count);
        Ok(Some(entry))
    }

    /// Stores the entry. When the map is full, expired entries are swept and
    /// the write is retried once.
    fn put(&self, text: &str, payload: Value, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(text, payload, self.clock.now(), ttl)?;

        match self.write_entry(&entry) {
            Err(err) if is_map_full(&err) => {
                log::warn!("cache map is full, sweeping expired entries before retrying");
                self.sweep_expired(entry.created_at)?;
                self.write_entry(&entry).map_err(CacheError::unavailable)
            }
            written => written.map_err(CacheError::unavailable),
        }
    }

    /// Deletes expired entries in small committed batches. A batch that
    /// fails because the map is full is retried once after growing the map.
    fn sweep_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError> {
        let expired = self.expired_keys(now).map_err(CacheError::unavailable)?;

        for batch in expired.chunks(SWEEP_BATCH) {
            match self.delete_batch(batch) {
                Err(err) if is_map_full(&err) => {
                    self.grow().map_err(CacheError::unavailable)?;
                    self.delete_batch(batch).map_err(CacheError::unavailable)?;
                }
                deleted => deleted.map_err(CacheError::unavailable)?,
            }
        }

        Ok(expired.len())
    }

    fn peek(&self, text: &str) -> Result<Option<CacheEntry>, CacheError> {
        let _map = self.map_size.read();
        let rtxn = self.env.read_txn().map_err(CacheError::unavailable)?;

        self.storage
            .get(&rtxn, &digest(text))
            .map_err(CacheError::unavailable)
    }
}

#[cfg(test)]
mod tests {
    use cache::ManualClock;
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        ))
    }

    #[test]
    fn round_trip_counts_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), clock()).unwrap();
        let rows = json!([{"name": "Milk", "platform": "blinkit", "price": 55.0}]);

        cache
            .put("cheapest milk", rows.clone(), Duration::from_secs(300))
            .unwrap();

        let first = cache.get("cheapest milk").unwrap().unwrap();
        let second = cache.get("cheapest milk").unwrap().unwrap();
        assert_eq!(first.payload, rows);
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);
        assert_eq!(cache.peek("cheapest milk").unwrap().unwrap().hit_count, 2);
    }

    #[test]
    fn expired_entries_are_hidden_then_swept() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let cache = LocalCache::new(dir.path(), clock.clone()).unwrap();

        cache.put("old", json!([]), Duration::from_secs(30)).unwrap();
        cache.put("fresh", json!([]), Duration::from_secs(600)).unwrap();
        clock.advance(chrono::Duration::seconds(31));

        assert!(cache.get("old").unwrap().is_none());
        assert!(cache.peek("old").unwrap().is_some());
        assert!(cache.get("fresh").unwrap().is_some());

        assert_eq!(cache.sweep_expired(clock.now()).unwrap(), 1);
        assert!(cache.peek("old").unwrap().is_none());
        assert!(cache.peek("fresh").unwrap().is_some());
    }

    #[test]
    fn put_replaces_entry_and_resets_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), clock()).unwrap();

        cache
            .put("cheapest milk", json!(["old"]), Duration::from_secs(300))
            .unwrap();
        cache.get("cheapest milk").unwrap().unwrap();
        cache.get("cheapest milk").unwrap().unwrap();
        cache
            .put("cheapest milk", json!(["new"]), Duration::from_secs(300))
            .unwrap();

        let stored = cache.peek("cheapest milk").unwrap().unwrap();
        assert_eq!(stored.payload, json!(["new"]));
        assert_eq!(stored.hit_count, 0);
    }

    #[test]
    fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();

        let cache = LocalCache::new(dir.path(), clock.clone()).unwrap();
        cache
            .put("cheapest onion", json!(["zepto"]), Duration::from_secs(300))
            .unwrap();
        drop(cache);

        let reopened = LocalCache::new(dir.path(), clock).unwrap();
        let entry = reopened.get("cheapest onion").unwrap().unwrap();
        assert_eq!(entry.key, digest("cheapest onion"));
        assert_eq!(entry.payload, json!(["zepto"]));
        assert_eq!(entry.hit_count, 1);
    }

    #[test]
    fn full_map_recovers_after_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let cache = LocalCache::with_map_size(dir.path(), clock.clone(), 256 * 1024).unwrap();
        let rows = json!([{"name": "x".repeat(300), "platform": "blinkit", "price": 55.0}]);

        let mut stored = 0;
        let err = loop {
            let question = format!("question {}", stored);
            match cache.put(&question, rows.clone(), Duration::from_secs(60)) {
                Ok(()) => stored += 1,
                Err(err) => break err,
            }
            assert!(stored < 10_000, "map never filled up");
        };
        assert!(matches!(err, CacheError::Unavailable(_)));
        assert!(stored > 0);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.sweep_expired(clock.now()).unwrap(), stored);
        assert!(cache.peek("question 0").unwrap().is_none());

        cache
            .put("cheapest onion", rows.clone(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("cheapest onion").unwrap().unwrap().payload, rows);
    }

    #[test]
    fn full_map_put_sweeps_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let cache = LocalCache::with_map_size(dir.path(), clock.clone(), 256 * 1024).unwrap();
        let rows = json!([{"name": "x".repeat(300), "platform": "zepto", "price": 38.0}]);

        for i in 0..1_000 {
            clock.advance(chrono::Duration::seconds(2));
            cache
                .put(&format!("question {}", i), rows.clone(), Duration::from_secs(1))
                .unwrap();
        }

        assert!(cache.peek("question 0").unwrap().is_none());
        assert!(cache.get("question 999").unwrap().is_some());
    }
}
