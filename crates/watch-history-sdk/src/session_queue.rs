//! 会话观看队列
//!
//! 功能包括：
//! - 收集播放过程中的观看记录
//! - 合并同一 pointer 的多次记录（取最大观看时间，会话标记只增不减）
//! - 节流（刚刷新过的 pointer 在窗口期内不再入队）
//! - 批量通过管理器发布

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, WatchHistoryError};
use crate::events::SyncEvent;
use crate::manager::{UpdateOptions, WatchHistoryManager};
use crate::network::IdentifierDecoder;
use crate::pointer::{normalize_watched_at, normalize_with, Pointer, PointerInput};
use crate::sync::PublishReport;
use crate::utils::time::now_millis;

/// 队列条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub pointer: Pointer,
    /// 首次入队时间（毫秒）
    pub added_at: i64,
    /// 最后更新时间（毫秒）
    pub updated_at: i64,
    revision: u64,
}

impl QueueEntry {
    fn merge(&mut self, incoming: Pointer, revision: u64) {
        let current = self.pointer.watched_at_or_zero();
        if incoming.watched_at_or_zero() > current {
            self.pointer.watched_at = incoming.watched_at;
        }
        if incoming.relay.is_some() {
            self.pointer.relay = incoming.relay;
        }
        if incoming.resume_at.is_some() {
            self.pointer.resume_at = incoming.resume_at;
        }
        self.pointer.completed |= incoming.completed;
        self.pointer.session |= incoming.session;
        self.updated_at = now_millis();
        self.revision = revision;
    }
}

/// 会话观看队列
pub struct SessionQueue {
    manager: WatchHistoryManager,
    /// actor -> (pointer key -> 条目)
    queues: RwLock<HashMap<String, BTreeMap<String, QueueEntry>>>,
    /// 最近一次刷新时间
    flushed: Mutex<HashMap<(String, String), Instant>>,
    throttle: Duration,
    revision: AtomicU64,
}

impl std::fmt::Debug for SessionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQueue")
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl SessionQueue {
    /// 使用配置中的节流窗口创建
    pub fn new(manager: WatchHistoryManager) -> Self {
        let throttle = manager.config().queue_throttle();
        Self::with_throttle(manager, throttle)
    }

    pub fn with_throttle(manager: WatchHistoryManager, throttle: Duration) -> Self {
        Self {
            manager,
            queues: RwLock::new(HashMap::new()),
            flushed: Mutex::new(HashMap::new()),
            throttle,
            revision: AtomicU64::new(0),
        }
    }

    /// 记录一次观看
    ///
    /// 返回 true 表示已入队，false 表示在节流窗口内被忽略
    pub async fn record_view<I: Into<PointerInput>>(
        &self,
        pointer: I,
        watched_at: Option<i64>,
        actor: Option<&str>,
    ) -> Result<bool> {
        let identity = self.manager.identity();
        let decoder = identity.decoder().map(|d| &**d as &dyn IdentifierDecoder);
        let mut pointer = normalize_with(pointer, decoder)
            .ok_or_else(|| WatchHistoryError::InvalidPointer("无法识别的 pointer".to_string()))?;
        let actor = identity.resolve_or_ensure(actor).await?;
        pointer.watched_at = Some(normalize_watched_at(&[watched_at, pointer.watched_at]));

        let key = pointer.key();
        let mut queues = self.queues.write().await;
        let queue = queues.entry(actor.clone()).or_default();

        if !queue.contains_key(&key) && self.recently_flushed(&actor, &key) {
            debug!("观看记录在节流窗口内，忽略: {}", key);
            return Ok(false);
        }

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        match queue.get_mut(&key) {
            Some(entry) => entry.merge(pointer, revision),
            None => {
                let now = now_millis();
                queue.insert(
                    key,
                    QueueEntry {
                        pointer,
                        added_at: now,
                        updated_at: now,
                        revision,
                    },
                );
            }
        }
        let size = queue.len();
        drop(queues);

        self.manager.events().emit(SyncEvent::QueueChanged { actor, size });
        Ok(true)
    }

    /// 发布队列中的记录
    ///
    /// 成功后移除已发布的条目（刷新期间又被更新的条目保留）；失败时队列保持不变，
    /// 由管理器的重发任务继续尝试。
    pub async fn flush(&self, actor: Option<&str>) -> Result<PublishReport> {
        let actor = self.manager.identity().resolve(actor)?;
        let snapshot: Vec<(String, QueueEntry)> = {
            let queues = self.queues.read().await;
            queues
                .get(&actor)
                .map(|queue| queue.iter().map(|(k, e)| (k.clone(), e.clone())).collect())
                .unwrap_or_default()
        };

        if snapshot.is_empty() {
            return Ok(PublishReport {
                ok: true,
                skipped: true,
                actor: Some(actor),
                ..PublishReport::default()
            });
        }

        info!("刷新会话观看队列: actor={}, 条目数={}", actor, snapshot.len());
        let pointers = snapshot.iter().map(|(_, entry)| entry.pointer.clone()).collect();
        let report = self
            .manager
            .update_list(pointers, UpdateOptions::for_actor(actor.clone()))
            .await?;

        if !report.ok {
            warn!(
                "会话观看队列发布失败，保留队列: {:?}",
                report.error.as_ref().map(|e| e.code())
            );
            return Ok(report);
        }

        let size = {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(actor.clone()).or_default();
            let now = Instant::now();
            let mut flushed = self.flushed.lock();
            for (key, entry) in &snapshot {
                if queue.get(key).map(|current| current.revision) == Some(entry.revision) {
                    queue.remove(key);
                }
                flushed.insert((actor.clone(), key.clone()), now);
            }
            let throttle = self.throttle;
            flushed.retain(|_, at| now.duration_since(*at) < throttle);
            queue.len()
        };

        self.manager.events().emit(SyncEvent::QueueChanged { actor, size });
        Ok(report)
    }

    /// 当前队列（按 pointer key 排序）
    pub async fn queued(&self, actor: &str) -> Vec<QueueEntry> {
        let Some(actor) = self.manager.identity().normalize(actor) else {
            return Vec::new();
        };
        self.queues
            .read()
            .await
            .get(&actor)
            .map(|queue| queue.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 清空 actor 的队列与节流记录
    pub async fn clear(&self, actor: &str) {
        let Some(actor) = self.manager.identity().normalize(actor) else {
            return;
        };
        let removed = self.queues.write().await.remove(&actor);
        self.flushed.lock().retain(|(owner, _), _| owner != &actor);
        if removed.is_some() {
            debug!("已清空会话观看队列: {}", actor);
            self.manager
                .events()
                .emit(SyncEvent::QueueChanged { actor, size: 0 });
        }
    }

    fn recently_flushed(&self, actor: &str, key: &str) -> bool {
        self.flushed
            .lock()
            .get(&(actor.to_string(), key.to_string()))
            .map(|at| at.elapsed() < self.throttle)
            .unwrap_or(false)
    }
}
