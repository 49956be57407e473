use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use moka::notification::RemovalCause;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cache::single_flight::SingleFlight;
use crate::cache::RemoteStore;
use crate::AppError;
use crate::AppError::InvalidConfig;
use crate::AppResult;

/// Cache keys need a deterministic string projection: it namespaces the far
/// tier and partitions single-flight groups.
pub trait CacheKey: Clone + Eq + Hash + Send + Sync + 'static {
    fn as_string(&self) -> String;
}

impl CacheKey for String {
    fn as_string(&self) -> String {
        self.clone()
    }
}

impl CacheKey for &'static str {
    fn as_string(&self) -> String {
        (*self).to_string()
    }
}

/// Serialization of values for the far tier.
pub trait ValueCodec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> AppResult<Bytes>;
    fn decode(&self, raw: &[u8]) -> AppResult<V>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<V> ValueCodec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &V) -> AppResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| AppError::CacheL2(format!("marshal failed: {}", e)))
    }

    fn decode(&self, raw: &[u8]) -> AppResult<V> {
        serde_json::from_slice(raw).map_err(|e| AppError::CacheL2(format!("unmarshal failed: {}", e)))
    }
}

type DirectFn<K, V> =
    Box<dyn Fn(K) -> Pin<Box<dyn Future<Output = AppResult<V>> + Send>> + Send + Sync>;

/// Read-through cache with an in-process near tier (L1), an optional remote
/// far tier (L2), and a single-flight origin load behind both.
///
/// `get` probes L1, then L2, then collapses concurrent misses per key into
/// one origin call; results are backfilled into the higher tiers
/// asynchronously. `set` writes through every enabled tier. The handle is
/// cheap to clone.
pub struct TieredCache<K: CacheKey, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K: CacheKey, V> Clone for TieredCache<K, V> {
    fn clone(&self) -> Self {
        TieredCache {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey, V> std::fmt::Debug for TieredCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache").finish_non_exhaustive()
    }
}

struct CacheInner<K: CacheKey, V> {
    prefix_key: String,
    l1: Option<moka::future::Cache<K, V>>,
    l2: Option<Arc<dyn RemoteStore>>,
    l2_ttl: Duration,
    direct_fn: DirectFn<K, V>,
    codec: Box<dyn ValueCodec<V>>,
    flight: SingleFlight<V>,
}

pub struct TieredCacheBuilder<K: CacheKey, V> {
    prefix_key: String,
    capacity: u64,
    l1_enable: bool,
    l1_ttl: Duration,
    l1_expire_reload: bool,
    l2_enable: bool,
    l2_store: Option<Arc<dyn RemoteStore>>,
    l2_ttl: Duration,
    l3_err_continue: bool,
    direct_fn: Option<DirectFn<K, V>>,
    codec: Box<dyn ValueCodec<V>>,
}

impl<K, V> TieredCache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn builder() -> TieredCacheBuilder<K, V> {
        TieredCacheBuilder {
            prefix_key: String::new(),
            capacity: 1000,
            l1_enable: true,
            l1_ttl: Duration::from_secs(300),
            l1_expire_reload: false,
            l2_enable: false,
            l2_store: None,
            l2_ttl: Duration::from_secs(600),
            l3_err_continue: false,
            direct_fn: None,
            codec: Box::new(JsonCodec),
        }
    }
}

impl<K, V> TieredCacheBuilder<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    /// Namespaces far-tier keys as `{prefix}:{key}`. Required.
    pub fn prefix_key(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_key = prefix.into();
        self
    }

    /// Enables the in-process tier. A `ttl` of zero means no expiry.
    pub fn l1(mut self, enable: bool, capacity: u64, ttl: Duration) -> Self {
        self.l1_enable = enable;
        self.capacity = capacity;
        self.l1_ttl = ttl;
        self
    }

    /// After an L1 entry expires, re-run the origin load in the background
    /// to prewarm the tiers.
    pub fn l1_expire_reload(mut self, enable: bool) -> Self {
        self.l1_expire_reload = enable;
        self
    }

    /// Enables the remote tier. A `ttl` of zero means no expiry.
    pub fn l2(mut self, enable: bool, store: Option<Arc<dyn RemoteStore>>, ttl: Duration) -> Self {
        self.l2_enable = enable;
        self.l2_store = store;
        self.l2_ttl = ttl;
        self
    }

    /// On an origin error, drop the single-flight entry before publishing,
    /// so the next caller restarts the load instead of joining the doomed
    /// flight.
    pub fn l3_err_continue(mut self, enable: bool) -> Self {
        self.l3_err_continue = enable;
        self
    }

    /// The origin loader invoked when every tier misses. Required.
    pub fn direct_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<V>> + Send + 'static,
    {
        self.direct_fn = Some(Box::new(move |key| Box::pin(f(key))));
        self
    }

    pub fn codec(mut self, codec: impl ValueCodec<V>) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn build(self) -> AppResult<TieredCache<K, V>> {
        if self.l2_enable
            && self.l1_enable
            && !self.l2_ttl.is_zero()
            && self.l2_ttl < self.l1_ttl
        {
            return Err(InvalidConfig(
                "l2 cache ttl should be bigger than l1 cache ttl".into(),
            ));
        }
        if self.prefix_key.is_empty() {
            return Err(InvalidConfig("prefix key is required".into()));
        }
        let Some(direct_fn) = self.direct_fn else {
            return Err(InvalidConfig("direct function is required".into()));
        };
        if self.l2_enable && self.l2_store.is_none() {
            return Err(InvalidConfig(
                "l2 cache is enabled but no remote store is provided".into(),
            ));
        }

        let mut reload_rx = None;
        let l1 = if self.l1_enable {
            let mut builder = moka::future::Cache::builder().max_capacity(self.capacity);
            if !self.l1_ttl.is_zero() {
                builder = builder.time_to_live(self.l1_ttl);
            }
            if self.l1_expire_reload {
                let (tx, rx) = mpsc::unbounded_channel::<K>();
                reload_rx = Some(rx);
                builder = builder.eviction_listener(move |key: Arc<K>, _value, cause| {
                    if cause == RemovalCause::Expired {
                        let _ = tx.send((*key).clone());
                    }
                });
            }
            Some(builder.build())
        } else {
            None
        };

        let cache = TieredCache {
            inner: Arc::new(CacheInner {
                prefix_key: self.prefix_key,
                l1,
                l2: if self.l2_enable { self.l2_store } else { None },
                l2_ttl: self.l2_ttl,
                direct_fn,
                codec: self.codec,
                flight: SingleFlight::new(self.l3_err_continue),
            }),
        };

        if let Some(mut rx) = reload_rx {
            // holds only a weak handle so dropping the cache ends the task
            let weak: Weak<CacheInner<K, V>> = Arc::downgrade(&cache.inner);
            tokio::spawn(async move {
                while let Some(key) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    let cache = TieredCache { inner };
                    if let Err(e) = cache.get(&key).await {
                        warn!(key = %key.as_string(), error = %e, "expire reload failed");
                    }
                }
            });
        }

        Ok(cache)
    }
}

impl<K, V> TieredCache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    fn store_key(&self, key: &K) -> String {
        format!("{}:{}", self.inner.prefix_key, key.as_string())
    }

    /// Probes L1, then L2, then the origin. Tier read errors are logged and
    /// fall through to the next tier; only origin errors reach the caller.
    pub async fn get(&self, key: &K) -> AppResult<V> {
        if let Some(l1) = &self.inner.l1 {
            if let Some(value) = l1.get(key).await {
                debug!(key = %key.as_string(), "cache hit in l1");
                return Ok(value);
            }
        }

        if let Some(store) = &self.inner.l2 {
            let store_key = self.store_key(key);
            match store.get(&store_key).await {
                Ok(Some(raw)) => match self.inner.codec.decode(&raw) {
                    Ok(value) => {
                        debug!(key = %store_key, "cache hit in l2");
                        if let Some(l1) = self.inner.l1.clone() {
                            let key = key.clone();
                            let value = value.clone();
                            tokio::spawn(async move {
                                l1.insert(key, value).await;
                            });
                        }
                        return Ok(value);
                    }
                    Err(e) => error!(key = %store_key, error = %e, "l2 decode failed"),
                },
                Ok(None) => {}
                Err(e) => warn!(key = %store_key, error = %e, "l2 read failed"),
            }
        }

        self.load_direct(key).await
    }

    /// Write-through: stores the value in every enabled tier. Returns the
    /// far-tier error when serialization or the remote write fails.
    pub async fn set(&self, key: &K, value: &V) -> AppResult<()> {
        let inner = &self.inner;
        if inner.l1.is_none() && inner.l2.is_none() {
            return Ok(());
        }

        if let Some(l1) = &inner.l1 {
            l1.insert(key.clone(), value.clone()).await;
        }

        if let Some(store) = &inner.l2 {
            let store_key = self.store_key(key);
            let raw = inner.codec.encode(value).map_err(|e| {
                error!(key = %store_key, error = %e, "l2 marshal failed");
                e
            })?;
            if let Err(e) = store.set(&store_key, raw, inner.l2_ttl).await {
                error!(key = %store_key, error = %e, "l2 write failed");
                return Err(AppError::CacheL2(format!("set {} failed: {}", store_key, e)));
            }
        }

        Ok(())
    }

    async fn load_direct(&self, key: &K) -> AppResult<V> {
        debug!(key = %key.as_string(), "loading from origin");
        let inner = self.inner.clone();
        let leader_key = key.clone();
        let load = move || {
            let fut = (inner.direct_fn)(leader_key.clone());
            async move {
                let value = fut.await?;
                // backfill the tiers without blocking the caller
                let cache = TieredCache {
                    inner: inner.clone(),
                };
                let key = leader_key;
                let cached = value.clone();
                tokio::spawn(async move {
                    if let Err(e) = cache.set(&key, &cached).await {
                        error!(key = %key.as_string(), error = %e, "caching origin result failed");
                    }
                });
                Ok(value)
            }
        };

        let (result, shared) = self.inner.flight.run(&key.as_string(), load).await;
        if shared {
            debug!(key = %key.as_string(), "joined in-flight origin load");
        }
        result.map_err(AppError::from)
    }
}
