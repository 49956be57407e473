use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, RemoteStore, TieredCache, TieredCacheBuilder};
use crate::service::manager::ManagerOptions;
use crate::AppError::InvalidConfig;
use crate::AppResult;

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// 0 means unlimited
    pub max_connection: usize,
    /// 0 disables idle reaping
    pub idle_timeout_ms: u64,
    pub reap_tick_ms: u64,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    pub prefix_key: String,
    pub l1_enable: bool,
    pub l1_capacity: u64,
    /// 0 means no expiry
    pub l1_ttl_ms: u64,
    pub l1_expire_reload: bool,
    pub l2_enable: bool,
    /// 0 means no expiry
    pub l2_ttl_ms: u64,
    pub l3_err_continue: bool,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FabricConfig {
    pub network: NetworkConfig,
    pub cache: CacheConfig,
}

impl FabricConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<FabricConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| InvalidConfig("config file path is not valid utf-8".into()))?;
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        let fabric_config: FabricConfig = raw.try_deserialize()?;
        Ok(fabric_config)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions::new(format!("{}:{}", self.network.ip, self.network.port))
            .with_max_conn(self.network.max_connection)
            .with_idle_timeout(Duration::from_millis(self.network.idle_timeout_ms))
            .with_reap_tick(Duration::from_millis(self.network.reap_tick_ms))
            .with_read_buffer_size(self.network.read_buffer_size)
            .with_max_frame_size(self.network.max_frame_size)
    }

    /// Seeds a cache builder from the `[cache]` section. The caller still
    /// supplies the origin loader, and the remote store when the far tier
    /// is enabled, before calling `build`.
    pub fn cache_builder<K, V>(
        &self,
        store: Option<Arc<dyn RemoteStore>>,
    ) -> TieredCacheBuilder<K, V>
    where
        K: CacheKey,
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        TieredCache::builder()
            .prefix_key(self.cache.prefix_key.clone())
            .l1(
                self.cache.l1_enable,
                self.cache.l1_capacity,
                Duration::from_millis(self.cache.l1_ttl_ms),
            )
            .l1_expire_reload(self.cache.l1_expire_reload)
            .l2(
                self.cache.l2_enable,
                store,
                Duration::from_millis(self.cache.l2_ttl_ms),
            )
            .l3_err_continue(self.cache.l3_err_continue)
    }
}
