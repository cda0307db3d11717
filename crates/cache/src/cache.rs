mod clock;
mod memory;

use std::time::Duration;

use chrono::NaiveDateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    memory::MemoryCache,
};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ttl of {0:?} is out of range")]
    InvalidTtl(Duration),
}

impl CacheError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// A cached answer for one query text.
///
/// An entry whose `expires_at` is not after the current time is logically
/// absent: stores must never hand it out from [`Cache::get`], even while it is
/// still physically stored and waiting for a sweep.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub query_text: String,
    pub payload: Value,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(
        text: &str,
        payload: Value,
        now: NaiveDateTime,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let ttl_delta = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
        let expires_at = now
            .checked_add_signed(ttl_delta)
            .ok_or(CacheError::InvalidTtl(ttl))?;

        Ok(CacheEntry {
            key: digest(text),
            query_text: text.to_owned(),
            payload,
            created_at: now,
            expires_at,
            hit_count: 0,
        })
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Hex SHA-256 of the exact input text. No normalization happens here.
pub fn digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

pub trait Cache: Send + Sync {
    /// Returns the live entry for `text`, incrementing its hit count.
    fn get(&self, text: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Replaces whatever is stored for `text` with a fresh entry.
    fn put(&self, text: &str, payload: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Removes every entry with `expires_at <= now` and returns how many went.
    fn sweep_expired(&self, now: NaiveDateTime) -> Result<usize, CacheError>;

    /// Returns the stored entry, expired or not, without counting a hit.
    fn peek(&self, text: &str) -> Result<Option<CacheEntry>, CacheError>;
}
