//! 观看历史 SDK 配置

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchHistoryError};
use crate::retry::RepublishPolicy;

/// 观看历史记录的 kind
pub const WATCH_HISTORY_KIND: u32 = 30079;

/// 观看历史 SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchHistoryConfig {
    /// 数据存储目录，None 时使用临时存储
    pub data_dir: Option<PathBuf>,
    /// 记录 kind
    pub kind: u32,
    /// 保留的最大条目数，0 表示不限制
    pub max_items: usize,
    /// 单个载荷明文的最大字节数
    pub payload_max_bytes: usize,
    /// 拉取月份头记录的数量上限
    pub fetch_event_limit: usize,
    /// 缓存 TTL 覆盖值（毫秒）
    pub cache_ttl_ms: Option<u64>,
    /// 缓存策略默认 TTL（毫秒）
    pub cache_policy_ttl_ms: Option<u64>,
    /// resolve 是否按批返回
    pub batch_resolve: bool,
    /// 每批条目数
    pub batch_page_size: usize,
    /// 默认 relay 列表（最低优先级）
    pub default_relays: Vec<String>,
    /// 重发策略
    pub republish: RepublishPolicy,
    /// 会话队列节流窗口（秒）
    pub queue_throttle_secs: u64,
    /// 是否在记录上附带明文 pointer 标签
    pub public_pointer_tags: bool,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
}

impl Default for WatchHistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            kind: WATCH_HISTORY_KIND,
            max_items: 1500,
            payload_max_bytes: 60_000,
            fetch_event_limit: 64,
            cache_ttl_ms: None,
            cache_policy_ttl_ms: None,
            batch_resolve: true,
            batch_page_size: 10,
            default_relays: Vec::new(),
            republish: RepublishPolicy::default(),
            queue_throttle_secs: 60,
            public_pointer_tags: true,
            event_buffer_size: 256,
        }
    }
}

impl WatchHistoryConfig {
    pub fn builder() -> WatchHistoryConfigBuilder {
        WatchHistoryConfigBuilder::new()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.payload_max_bytes == 0 {
            return Err(WatchHistoryError::Config("payload_max_bytes 必须大于 0".to_string()));
        }
        if self.fetch_event_limit == 0 {
            return Err(WatchHistoryError::Config("fetch_event_limit 必须大于 0".to_string()));
        }
        if self.batch_resolve && self.batch_page_size == 0 {
            return Err(WatchHistoryError::Config("batch_page_size 必须大于 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.republish.jitter_factor) {
            return Err(WatchHistoryError::Config("jitter_factor 必须在 0.0-1.0 之间".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    pub fn cache_policy_ttl(&self) -> Option<Duration> {
        self.cache_policy_ttl_ms.map(Duration::from_millis)
    }

    pub fn queue_throttle(&self) -> Duration {
        Duration::from_secs(self.queue_throttle_secs)
    }

    /// resolve 返回的条目上限，0 表示不限制
    pub fn resolve_limit(&self) -> usize {
        if !self.batch_resolve {
            return self.max_items;
        }
        if self.max_items == 0 {
            self.batch_page_size
        } else {
            self.batch_page_size.min(self.max_items)
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct WatchHistoryConfigBuilder {
    config: WatchHistoryConfig,
}

impl WatchHistoryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn max_items(mut self, max_items: usize) -> Self {
        self.config.max_items = max_items;
        self
    }

    pub fn payload_max_bytes(mut self, bytes: usize) -> Self {
        self.config.payload_max_bytes = bytes;
        self
    }

    pub fn fetch_event_limit(mut self, limit: usize) -> Self {
        self.config.fetch_event_limit = limit;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn cache_policy_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_policy_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn batch_resolve(mut self, enabled: bool, page_size: usize) -> Self {
        self.config.batch_resolve = enabled;
        self.config.batch_page_size = page_size;
        self
    }

    /// 设置默认 relay 列表（按优先级顺序）
    pub fn default_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.default_relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn republish(mut self, policy: RepublishPolicy) -> Self {
        self.config.republish = policy;
        self
    }

    pub fn queue_throttle(mut self, window: Duration) -> Self {
        self.config.queue_throttle_secs = window.as_secs();
        self
    }

    pub fn public_pointer_tags(mut self, enabled: bool) -> Self {
        self.config.public_pointer_tags = enabled;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> WatchHistoryConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WatchHistoryConfig::default();
        assert_eq!(config.kind, 30079);
        assert_eq!(config.max_items, 1500);
        assert_eq!(config.payload_max_bytes, 60_000);
        assert_eq!(config.fetch_event_limit, 64);
        assert_eq!(config.resolve_limit(), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = WatchHistoryConfig::builder()
            .max_items(5)
            .batch_resolve(true, 20)
            .default_relays(["wss://a", "wss://b"])
            .queue_throttle(Duration::from_secs(30))
            .build();
        assert_eq!(config.resolve_limit(), 5);
        assert_eq!(config.default_relays.len(), 2);
        assert_eq!(config.queue_throttle(), Duration::from_secs(30));

        let config = WatchHistoryConfig::builder().batch_resolve(false, 0).build();
        assert_eq!(config.resolve_limit(), 1500);
        assert!(config.validate().is_ok());

        let err = WatchHistoryConfig::builder().payload_max_bytes(0).build().validate().unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: WatchHistoryConfig =
            serde_json::from_str(r#"{"maxItems": 1, "max_items": 3, "default_relays": ["wss://x"]}"#).unwrap();
        assert_eq!(config.max_items, 3);
        assert_eq!(config.default_relays, vec!["wss://x".to_string()]);
        assert_eq!(config.kind, WATCH_HISTORY_KIND);
    }
}
