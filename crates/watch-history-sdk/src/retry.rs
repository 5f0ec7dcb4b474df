//! 重发调度
//!
//! 每个任务 ID 同一时间只有一个定时器。重复调度会取消并替换旧定时器，
//! 但尝试次数取两者较大值，退避不会因重新进入而回落。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, WatchHistoryError};
use crate::events::{EventManager, SyncEvent};

/// 重发退避策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepublishPolicy {
    /// 第 0 次尝试的延迟（毫秒），用于近乎立即的首次重发
    pub initial_delay_ms: u64,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 随机抖动上限 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RepublishPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000, // 5分钟
            max_attempts: 8,
            jitter_factor: 0.25,
        }
    }
}

impl RepublishPolicy {
    /// 不含抖动的延迟：第 0 次为 `initial_delay_ms`，之后为 `min(base * 2^n, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.initial_delay_ms);
        }
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// 指定抖动比例的延迟，抖动被限制在 `[0, jitter_factor]`
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay(attempt);
        if attempt == 0 {
            return base;
        }
        let jitter = jitter.clamp(0.0, self.jitter_factor.max(0.0));
        base.mul_f64(1.0 + jitter)
    }

    /// 带随机抖动的延迟
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::random::<f64>() * self.jitter_factor;
        self.delay_with_jitter(attempt, jitter)
    }

    /// 该尝试次数是否还允许调度
    pub fn can_schedule(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 重发操作，参数为本次尝试次数
pub type RepublishOperation = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct PendingTask {
    attempt: u32,
    generation: u64,
    running: bool,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    policy: RepublishPolicy,
    tasks: Mutex<HashMap<String, PendingTask>>,
    generation: AtomicU64,
    events: Arc<EventManager>,
}

/// 重发调度器
#[derive(Clone)]
pub struct RepublishScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for RepublishScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepublishScheduler")
            .field("policy", &self.inner.policy)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RepublishScheduler {
    pub fn new(policy: RepublishPolicy, events: Arc<EventManager>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                policy,
                tasks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn policy(&self) -> &RepublishPolicy {
        &self.inner.policy
    }

    /// 调度任务，返回实际使用的尝试次数
    ///
    /// 超过最大尝试次数时不再布置定时器，返回 `RepublishExhausted`。
    pub fn schedule(&self, task_id: &str, attempt: u32, operation: RepublishOperation) -> Result<u32> {
        self.inner.schedule(task_id, attempt, operation)
    }

    /// 取消待执行的定时器，正在执行的操作会继续完成
    pub fn cancel(&self, task_id: &str) -> bool {
        self.inner.cancel(task_id)
    }

    /// 取消所有待执行的定时器
    pub fn cancel_all(&self) {
        let drained: Vec<(String, PendingTask)> = self.inner.tasks.lock().drain().collect();
        for (task_id, task) in drained {
            if !task.running {
                task.handle.abort();
            }
            debug!("已取消重发任务: {}", task_id);
        }
    }

    /// 当前登记的尝试次数
    pub fn pending_attempt(&self, task_id: &str) -> Option<u32> {
        self.inner.tasks.lock().get(task_id).map(|t| t.attempt)
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.inner.tasks.lock().contains_key(task_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl SchedulerInner {
    fn schedule(
        self: &Arc<Self>,
        task_id: &str,
        attempt: u32,
        operation: RepublishOperation,
    ) -> Result<u32> {
        let mut tasks = self.tasks.lock();
        let effective = tasks
            .get(task_id)
            .map(|pending| pending.attempt.max(attempt))
            .unwrap_or(attempt);

        if !self.policy.can_schedule(effective) {
            if let Some(previous) = tasks.remove(task_id) {
                if !previous.running {
                    previous.handle.abort();
                }
            }
            drop(tasks);
            warn!("重发任务 {} 已达到最大尝试次数 {}，停止调度", task_id, effective);
            self.events.emit(SyncEvent::RepublishExhausted {
                task_id: task_id.to_string(),
                attempts: effective,
            });
            return Err(WatchHistoryError::RepublishExhausted {
                task_id: task_id.to_string(),
                attempts: effective,
            });
        }

        if let Some(previous) = tasks.remove(task_id) {
            if !previous.running {
                previous.handle.abort();
            }
        }

        let delay = self.policy.delay(effective);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run(id, generation, effective, operation).await;
        });
        tasks.insert(
            task_id.to_string(),
            PendingTask {
                attempt: effective,
                generation,
                running: false,
                handle,
            },
        );
        drop(tasks);

        debug!(
            "重发任务 {} 已调度: attempt={}, delay={}ms",
            task_id,
            effective,
            delay.as_millis()
        );
        self.events.emit(SyncEvent::RepublishScheduled {
            task_id: task_id.to_string(),
            attempt: effective,
            delay_ms: delay.as_millis() as u64,
        });
        Ok(effective)
    }

    fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.lock().remove(task_id) {
            Some(task) => {
                if !task.running {
                    task.handle.abort();
                }
                debug!("已取消重发任务: {}", task_id);
                true
            }
            None => false,
        }
    }

    /// 任务仍是当前这一代时移除登记，返回是否移除
    fn finish(&self, task_id: &str, generation: u64) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(task_id) {
            Some(task) if task.generation == generation => {
                tasks.remove(task_id);
                true
            }
            _ => false,
        }
    }

    async fn run(self: Arc<Self>, task_id: String, generation: u64, attempt: u32, operation: RepublishOperation) {
        {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(task) if task.generation == generation => task.running = true,
                _ => return,
            }
        }

        info!("🔁 执行重发任务 {} (attempt {})", task_id, attempt);
        let result = (operation)(attempt).await;

        // 执行期间被取消或被新的调度替换时，由新的登记负责后续
        if !self.finish(&task_id, generation) {
            debug!("重发任务 {} 在执行期间被取消或替换", task_id);
            return;
        }

        match result {
            Ok(()) => {
                info!("✅ 重发任务 {} 成功", task_id);
                self.events.emit(SyncEvent::RepublishSucceeded { task_id, attempt });
            }
            Err(e) if e.is_retryable() => {
                warn!("重发任务 {} 失败 (attempt {}): {}，继续退避", task_id, attempt, e);
                if let Err(exhausted) = self.schedule(&task_id, attempt + 1, operation) {
                    warn!("{}", exhausted);
                }
            }
            Err(e) => {
                warn!("重发任务 {} 遇到不可重试错误: {}", task_id, e);
                self.events.emit(SyncEvent::RepublishAbandoned {
                    task_id,
                    attempt,
                    error: e.code().to_string(),
                });
            }
        }
    }
}
