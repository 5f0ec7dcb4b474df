//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 按命名空间隔离的 Tree
//! - JSON 序列化的读写
//! - 打开数据库时的锁冲突重试

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{Result, WatchHistoryError};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    /// 主数据库实例
    db: Arc<Db>,
    /// 已打开的命名空间 Tree
    trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 在 `base_path/kv` 下创建 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| WatchHistoryError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 同一目录的旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::warn!("sled 数据库被占用，{}ms 后重试 (第 {} 次)", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            WatchHistoryError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        tracing::info!("KV 存储已打开: {}", kv_path.display());

        Ok(Self {
            db: Arc::new(db),
            trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 临时存储，进程退出后删除（未配置数据目录时使用）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| WatchHistoryError::KvStore(format!("打开临时 sled 数据库失败: {}", e)))?;
        Ok(Self {
            db: Arc::new(db),
            trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 获取（必要时打开）命名空间 Tree
    async fn tree(&self, namespace: &str) -> Result<Tree> {
        if let Some(tree) = self.trees.read().await.get(namespace) {
            return Ok(tree.clone());
        }

        let tree = self
            .db
            .open_tree(namespace)
            .map_err(|e| WatchHistoryError::KvStore(format!("打开命名空间 Tree 失败: {}", e)))?;
        self.trees
            .write()
            .await
            .insert(namespace.to_string(), tree.clone());
        tracing::debug!("KV 命名空间已打开: {}", namespace);
        Ok(tree)
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, namespace: &str, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.tree(namespace).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| WatchHistoryError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| WatchHistoryError::KvStore(format!("设置键值对失败: {}", e)))?;
        tree.flush_async()
            .await
            .map_err(|e| WatchHistoryError::KvStore(format!("刷新 KV 存储失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, namespace: &str, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(namespace).await?;

        let result = tree
            .get(key)
            .map_err(|e| WatchHistoryError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| WatchHistoryError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_kv_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let kv = KvStore::new(temp_dir.path()).await.unwrap();

        let sample = Sample {
            name: "alice".into(),
            count: 3,
        };
        kv.set("ns", "key", &sample).await.unwrap();

        let loaded: Option<Sample> = kv.get("ns", "key").await.unwrap();
        assert_eq!(loaded, Some(sample));

        let other: Option<Sample> = kv.get("other", "key").await.unwrap();
        assert!(other.is_none());

        kv.set("ns", "key", &Sample { name: "bob".into(), count: 1 }).await.unwrap();
        let replaced: Option<Sample> = kv.get("ns", "key").await.unwrap();
        assert_eq!(replaced.map(|s| s.count), Some(1));
    }

    #[tokio::test]
    async fn test_kv_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let kv = KvStore::new(temp_dir.path()).await.unwrap();
            kv.set("ns", "n", &42u32).await.unwrap();
        }
        let kv = KvStore::new(temp_dir.path()).await.unwrap();
        let value: Option<u32> = kv.get("ns", "n").await.unwrap();
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_serialization_error() {
        let kv = KvStore::temporary().unwrap();
        kv.set("ns", "key", &"text").await.unwrap();
        let err = kv.get::<_, Sample>("ns", "key").await.unwrap_err();
        assert_eq!(err.code(), "serialization");
    }
}
