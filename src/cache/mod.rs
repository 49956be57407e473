//! Multi-tier read-through caching.
//!
//! `TieredCache` keeps a capacity- and TTL-bounded in-process tier in front
//! of an optional remote key-value tier, and collapses concurrent misses
//! for one key into a single origin load. Backfills of the higher tiers run
//! asynchronously.

pub use store::{MemoryStore, RemoteStore};
pub use tiered::{CacheKey, JsonCodec, TieredCache, TieredCacheBuilder, ValueCodec};

mod single_flight;
mod store;
mod tiered;
