use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::AppResult;

/// Contract for the far cache tier: a remote key-value store with per-entry
/// expiry. A `ttl` of zero means the entry never expires.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> AppResult<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> AppResult<()>;
}

/// In-process `RemoteStore` for tests and single-node deployments. Expired
/// entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Bytes, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<Bytes>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> AppResult<()> {
        let deadline = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.entries.lock().insert(key.to_string(), (value, deadline));
        Ok(())
    }
}
