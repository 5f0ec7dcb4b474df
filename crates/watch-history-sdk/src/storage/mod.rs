//! 存储模块
//!
//! - `kv`: 基于 sled 的命名空间键值存储
//! - `cache`: 按 actor 的观看历史本地缓存，带 TTL 与持久化

pub mod cache;
pub mod kv;

pub use cache::{
    CacheEntry, CacheMetadata, CacheOptions, CacheStatus, LocalCacheStore, CACHE_SCHEMA_VERSION,
    DEFAULT_CACHE_TTL,
};
pub use kv::KvStore;
