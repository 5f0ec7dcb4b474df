//! 远端同步模块
//!
//! 职责：
//! - 选择读写 relay
//! - 构建、加密、签名并发布月份记录（含分片）
//! - 拉取、解密、合并远端记录并写入本地缓存

pub mod client;

pub use client::{
    FetchOptions, FetchResult, FetchSource, MonthPublishResult, MonthReport, PublishOptions,
    PublishReport, RelayOutcome, RemoteSyncClient,
};
