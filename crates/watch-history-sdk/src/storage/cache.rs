//! 本地缓存
//!
//! 内存中按 actor 保存最近一次快照，同时把全部 actor 写成一个 JSON 文档
//! 持久化到 sled。每次写入都重新规范化条目并清理过期 actor。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::fingerprint;
use crate::error::{Result, WatchHistoryError};
use crate::identity::normalize_actor_key;
use crate::network::Record;
use crate::pointer::{bucket, canonicalize_items, BucketSet, Pointer};
use crate::storage::kv::KvStore;
use crate::utils::time::now_millis;

/// 持久化文档的结构版本，不一致时视为空文档并重写
pub const CACHE_SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CACHE_NAMESPACE: &str = "watch_history";
const CACHE_DOCUMENT_KEY: &str = "cache";

/// 最近一次同步状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    #[default]
    Ok,
    Partial,
    Error,
}

/// 缓存元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheMetadata {
    pub status: CacheStatus,
    /// 错误码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<i64>,
    pub decrypt_errors: usize,
    pub skipped_count: usize,
    pub auto_snapshot_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_snapshot_attempted_at: Option<i64>,
}

/// 单个 actor 的缓存条目
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheEntry {
    pub actor: String,
    pub records: BucketSet,
    /// `records` 展平去重后的规范列表
    pub items: Vec<Pointer>,
    pub snapshot_id: Option<String>,
    /// 最近看到或发布的月份头记录
    pub pointer_event: Option<Record>,
    /// 写入时间（毫秒）
    pub saved_at: i64,
    pub fingerprint: String,
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    pub fn new<S: Into<String>>(actor: S, items: Vec<Pointer>) -> Self {
        Self {
            actor: actor.into(),
            items,
            ..Self::default()
        }
    }

    pub fn with_snapshot_id(mut self, snapshot_id: Option<String>) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn with_pointer_event(mut self, pointer_event: Option<Record>) -> Self {
        self.pointer_event = pointer_event;
        self
    }

    pub fn with_metadata(mut self, metadata: CacheMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn is_expired(&self, now: i64, ttl: Duration) -> bool {
        now.saturating_sub(self.saved_at) >= ttl.as_millis() as i64
    }

    /// 由 `records` 与 `items` 的并集重新推导两者及指纹
    fn rederive(&mut self, max_items: usize) {
        let merged = canonicalize_items(
            self.records
                .iter()
                .flat_map(|(_, pointers)| pointers.iter().cloned())
                .chain(self.items.drain(..)),
            max_items,
        );
        self.fingerprint = fingerprint(&merged);
        self.records = bucket(merged.clone());
        self.items = merged;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    actors: BTreeMap<String, CacheEntry>,
}

/// 缓存选项
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// 显式配置的 TTL，优先级最高
    pub ttl_override: Option<Duration>,
    /// 策略默认 TTL
    pub policy_ttl: Option<Duration>,
    /// 0 表示不截断
    pub max_items: usize,
}

/// 本地缓存存储
#[derive(Debug)]
pub struct LocalCacheStore {
    kv: Arc<KvStore>,
    options: CacheOptions,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LocalCacheStore {
    pub fn new(kv: Arc<KvStore>, options: CacheOptions) -> Self {
        Self {
            kv,
            options,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.options
            .ttl_override
            .or(self.options.policy_ttl)
            .unwrap_or(DEFAULT_CACHE_TTL)
    }

    /// 加载持久化文档：丢弃过期和无法规范化的 actor，有变动时写回
    pub async fn init(&self) -> Result<usize> {
        let now = now_millis();
        let ttl = self.ttl();
        let (document, mut mutated) = match self
            .kv
            .get::<_, CacheDocument>(CACHE_NAMESPACE, CACHE_DOCUMENT_KEY)
            .await
        {
            Ok(Some(document)) if document.version == CACHE_SCHEMA_VERSION => (document, false),
            Ok(Some(document)) => {
                warn!(
                    "观看历史缓存版本不一致 ({} != {})，丢弃旧数据",
                    document.version, CACHE_SCHEMA_VERSION
                );
                (CacheDocument::default(), true)
            }
            Ok(None) => (CacheDocument::default(), false),
            Err(WatchHistoryError::Serialization(e)) => {
                warn!("观看历史缓存文档损坏，重新初始化: {}", e);
                (CacheDocument::default(), true)
            }
            Err(e) => return Err(e),
        };

        let mut loaded = HashMap::new();
        for (key, mut entry) in document.actors {
            let Some(actor_key) = normalize_actor_key(&key, None) else {
                mutated = true;
                continue;
            };
            if entry.is_expired(now, ttl) {
                debug!("丢弃过期的观看历史缓存: {}", actor_key);
                mutated = true;
                continue;
            }
            if actor_key != key {
                mutated = true;
            }
            entry.rederive(self.options.max_items);
            loaded.insert(actor_key, entry);
        }

        let count = loaded.len();
        *self.entries.write().await = loaded;
        if mutated {
            self.write_document().await?;
        }
        info!("观看历史缓存已加载: {} 个 actor", count);
        Ok(count)
    }

    /// TTL 内的缓存条目，`force` 为 true 时总是返回 None
    pub async fn fresh(&self, actor: &str, force: bool) -> Option<CacheEntry> {
        if force {
            return None;
        }
        let key = normalize_actor_key(actor, None)?;
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.is_expired(now_millis(), self.ttl()) {
            return None;
        }
        Some(entry.clone())
    }

    /// 当前缓存条目，不检查 TTL
    pub async fn get(&self, actor: &str) -> Option<CacheEntry> {
        let key = normalize_actor_key(actor, None)?;
        self.entries.read().await.get(&key).cloned()
    }

    /// 写入条目：重新规范化、刷新指纹与时间戳、清理过期 actor 并持久化
    pub async fn persist(&self, actor: &str, mut entry: CacheEntry) -> Result<CacheEntry> {
        let key = normalize_actor_key(actor, None).ok_or(WatchHistoryError::MissingActor)?;
        let now = now_millis();
        entry.rederive(self.options.max_items);
        entry.saved_at = now;
        if entry.actor.trim().is_empty() {
            entry.actor = key.clone();
        }

        {
            let ttl = self.ttl();
            let mut entries = self.entries.write().await;
            entries.retain(|_, existing| !existing.is_expired(now, ttl));
            entries.insert(key.clone(), entry.clone());
        }
        self.write_document().await?;
        debug!(
            "观看历史缓存已写入: actor={}, items={}, months={}",
            key,
            entry.items.len(),
            entry.records.len()
        );
        Ok(entry)
    }

    /// 删除某个 actor 的缓存
    pub async fn remove(&self, actor: &str) -> Result<bool> {
        let Some(key) = normalize_actor_key(actor, None) else {
            return Ok(false);
        };
        let removed = self.entries.write().await.remove(&key).is_some();
        if removed {
            self.write_document().await?;
        }
        Ok(removed)
    }

    /// 清空内存缓存，持久化数据保留
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }

    pub async fn actors(&self) -> Vec<String> {
        let mut actors: Vec<String> = self.entries.read().await.keys().cloned().collect();
        actors.sort();
        actors
    }

    async fn write_document(&self) -> Result<()> {
        let actors: BTreeMap<String, CacheEntry> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        let document = CacheDocument {
            version: CACHE_SCHEMA_VERSION,
            actors,
        };
        self.kv
            .set(CACHE_NAMESPACE, CACHE_DOCUMENT_KEY, &document)
            .await
    }
}
