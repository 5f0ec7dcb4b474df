//! 事件系统模块
//!
//! 功能包括：
//! - 会话队列变更事件
//! - 重发任务调度 / 成功 / 放弃 / 耗尽事件
//! - 指纹变更与快照结果事件
//! - 事件广播和订阅机制

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::utils::time::now_millis;

/// 观看历史同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 会话队列内容变化
    QueueChanged { actor: String, size: usize },
    /// 重发任务已调度
    RepublishScheduled {
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// 重发成功，任务已结束
    RepublishSucceeded { task_id: String, attempt: u32 },
    /// 不可重试的失败，任务已放弃
    RepublishAbandoned {
        task_id: String,
        attempt: u32,
        error: String,
    },
    /// 达到最大尝试次数
    RepublishExhausted { task_id: String, attempts: u32 },
    /// 指纹变化
    FingerprintChanged {
        actor: String,
        previous: Option<String>,
        current: String,
    },
    /// 一次快照发布的结果
    SnapshotCompleted {
        actor: String,
        ok: bool,
        retryable: bool,
        error: Option<String>,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::QueueChanged { .. } => "queue_changed",
            SyncEvent::RepublishScheduled { .. } => "republish_scheduled",
            SyncEvent::RepublishSucceeded { .. } => "republish_succeeded",
            SyncEvent::RepublishAbandoned { .. } => "republish_abandoned",
            SyncEvent::RepublishExhausted { .. } => "republish_exhausted",
            SyncEvent::FingerprintChanged { .. } => "fingerprint_changed",
            SyncEvent::SnapshotCompleted { .. } => "snapshot_completed",
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间（毫秒）
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Debug)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(now_millis());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 1);

        manager.emit(SyncEvent::QueueChanged {
            actor: "alice".into(),
            size: 2,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "queue_changed");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("queue_changed"), Some(&1));
        assert!(stats.last_event_time.is_some());
    }

    #[test]
    fn test_emit_without_receivers() {
        let manager = EventManager::default();
        manager.emit(SyncEvent::RepublishExhausted {
            task_id: "t".into(),
            attempts: 8,
        });
        assert_eq!(manager.get_stats().total_events, 1);
    }
}
