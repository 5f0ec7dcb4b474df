//! relay 网络层抽象
//!
//! 记录信封、查询过滤器，以及由宿主平台实现的传输能力。
//! SDK 本身不实现消息总线的线协议，只通过 [`RelayTransport`] 收发记录。

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(test)]
pub mod test_helpers;

/// 已签名的记录信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// 作者公钥（actor key）
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Record {
    /// 第一个名为 `name` 的标签值
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// 所有名为 `name` 的标签值
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// 可寻址记录的 `d` 标识
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }
}

/// 待签名的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedRecord {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// relay 查询过滤器
///
/// `tags` 的键不带 `#` 前缀，例如 `d` 对应线上的 `#d`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: Vec<u32>,
    pub authors: Vec<String>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author<S: Into<String>>(mut self, author: S) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 判断记录是否满足过滤条件（不考虑 limit）
    pub fn matches(&self, record: &Record) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| a == &record.pubkey) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            record
                .tag_values(name)
                .any(|value| values.iter().any(|v| v == value))
        })
    }
}

/// 实时订阅的记录流，丢弃接收端即取消订阅
pub type RecordStream = mpsc::Receiver<Record>;

/// relay 传输能力（由平台层注入）
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// 向单个 relay 发布记录，relay 接受时返回 Ok
    async fn publish(&self, relay: &str, record: &Record) -> Result<()>;

    /// 从一组 relay 查询记录
    async fn list(&self, relays: &[String], filters: &[Filter]) -> Result<Vec<Record>>;

    /// 订阅实时记录，不支持订阅的传输返回 None
    async fn subscribe(&self, _relays: &[String], _filters: &[Filter]) -> Result<Option<RecordStream>> {
        Ok(None)
    }
}

/// relay 地址目录
pub trait RelayDirectory: Send + Sync {
    fn read_relays(&self) -> Vec<String>;
    fn write_relays(&self) -> Vec<String>;
    fn fallback_relays(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 编码标识符解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedIdentifier {
    Pubkey(String),
    Event {
        id: String,
        relays: Vec<String>,
    },
    Address {
        kind: u32,
        pubkey: String,
        identifier: String,
        relays: Vec<String>,
    },
}

/// 编码标识符（`npub` / `nevent` / `naddr`）解码能力
pub trait IdentifierDecoder: Send + Sync {
    fn decode(&self, value: &str) -> Option<DecodedIdentifier>;
}

/// 去重并保持顺序地合并 relay 列表，忽略空白地址
pub fn dedupe_relays<I, S>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut relays: Vec<String> = Vec::new();
    for candidate in candidates {
        let trimmed = candidate.as_ref().trim();
        if trimmed.is_empty() || relays.iter().any(|r| r == trimmed) {
            continue;
        }
        relays.push(trimmed.to_string());
    }
    relays
}
