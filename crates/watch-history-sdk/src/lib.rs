//! Watch History SDK - 观看历史同步引擎
//!
//! 把用户的观看记录按 UTC 月份分桶，加密后作为可寻址记录发布到多个 relay，
//! 并维护一份带 TTL 的本地缓存。主要功能：
//! - 🧭 pointer 规范化、去重合并与按月分桶
//! - 📦 载荷编解码与按字节预算分片
//! - 🔐 加密方案协商（nip44_v2 优先，兼容旧格式解密）
//! - 🪪 身份解析（显式 > 登录 > 临时会话）
//! - 🔁 可重试失败的指数退避重发
//! - 💾 sled 本地缓存
//! - 🎬 会话观看队列（合并、节流、批量发布）
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use watch_history_sdk::{Capabilities, Pointer, UpdateOptions, WatchHistoryConfig, WatchHistoryManager};
//!
//! # async fn run(capabilities: Capabilities) -> watch_history_sdk::Result<()> {
//! let config = WatchHistoryConfig::builder()
//!     .data_dir("/path/to/data")
//!     .default_relays(["wss://relay.example.com"])
//!     .build();
//! let manager = WatchHistoryManager::new(config, capabilities).await?;
//!
//! let report = manager
//!     .update_list(vec![Pointer::event("abcd").with_watched_at(1_700_000_000)], UpdateOptions::default())
//!     .await?;
//! if !report.ok {
//!     println!("发布失败: {:?}，可重试: {}", report.error, report.retryable);
//! }
//!
//! let items = manager.resolve(None, Default::default()).await?;
//! println!("最近观看: {}", items.len());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod network;
pub mod pointer;
pub mod retry;
pub mod session_queue;
pub mod storage;
pub mod sync;
pub mod utils;

pub use capabilities::Capabilities;
pub use config::{WatchHistoryConfig, WatchHistoryConfigBuilder, WATCH_HISTORY_KIND};
pub use crypto::{ActiveSigner, EncryptionNegotiator, EncryptionScheme, KeyToolkit};
pub use error::{Result, WatchHistoryError};
pub use events::{EventManager, EventStats, SyncEvent};
pub use identity::{IdentityResolver, SessionActor, SessionProvider, SigningContext};
pub use manager::{republish_task_id, UpdateOptions, WatchHistoryManager};
pub use network::{
    DecodedIdentifier, Filter, IdentifierDecoder, Record, RecordStream, RelayDirectory, RelayTransport,
    UnsignedRecord,
};
pub use pointer::{normalize, normalize_with, BucketSet, Pointer, PointerInput, PointerType};
pub use retry::{RepublishPolicy, RepublishScheduler};
pub use session_queue::{QueueEntry, SessionQueue};
pub use storage::{CacheEntry, CacheMetadata, CacheStatus, LocalCacheStore};
pub use sync::{FetchOptions, FetchResult, FetchSource, PublishOptions, PublishReport, RemoteSyncClient};
