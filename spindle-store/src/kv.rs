use crate::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Key-value service with per-entry TTL. Backs the worker's account cache.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Returns `None` for missing or expired entries.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory KV service with lazy expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, (Bytes, Option<Instant>)>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvCache for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires) = entry.value();
            if expires.map(|at| Instant::now() < at).unwrap_or(true) {
                return Ok(Some(value.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: drop it.
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let expires = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.entries.insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
