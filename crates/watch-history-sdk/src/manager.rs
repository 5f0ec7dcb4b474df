//! 观看历史管理器
//!
//! 对外的主要入口。负责把列表更新规范化后发布、写入本地缓存，
//! 并在可重试的失败后为 actor 布置重发任务。
//!
//! 本地校验失败（无法确定身份、无效 pointer、存储错误）以 `Err` 返回；
//! 远端发布失败体现在 [`PublishReport`] 中。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::codec::fingerprint;
use crate::config::WatchHistoryConfig;
use crate::error::{Result, WatchHistoryError};
use crate::events::{EventManager, EventStats, SyncEvent};
use crate::identity::IdentityResolver;
use crate::network::IdentifierDecoder;
use crate::pointer::{bucket, canonicalize, canonicalize_items, normalize_with, BucketSet, Pointer, PointerInput};
use crate::retry::{RepublishOperation, RepublishScheduler};
use crate::storage::{CacheEntry, CacheOptions, CacheStatus, KvStore, LocalCacheStore};
use crate::sync::{FetchOptions, FetchResult, FetchSource, PublishOptions, PublishReport, RemoteSyncClient};
use crate::utils::time::now_millis;

/// actor 对应的重发任务 ID
pub fn republish_task_id(actor: &str) -> String {
    format!("watch-history:{}", actor)
}

/// 列表更新选项
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub actor: Option<String>,
    /// 用输入完全替换已有列表，而不是与缓存合并
    pub replace: bool,
    pub snapshot_id: Option<String>,
    pub relays: Vec<String>,
}

impl UpdateOptions {
    pub fn for_actor<S: Into<String>>(actor: S) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<FetchResult>>>;

struct ManagerInner {
    config: Arc<WatchHistoryConfig>,
    client: RemoteSyncClient,
    scheduler: RepublishScheduler,
    events: Arc<EventManager>,
    fingerprints: Mutex<HashMap<String, String>>,
    refreshes: Mutex<HashMap<String, SharedRefresh>>,
}

/// 观看历史管理器
#[derive(Clone)]
pub struct WatchHistoryManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for WatchHistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHistoryManager")
            .field("client", &self.inner.client)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl WatchHistoryManager {
    /// 创建管理器并加载本地缓存
    pub async fn new(config: WatchHistoryConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        let kv = match &config.data_dir {
            Some(dir) => KvStore::new(dir).await?,
            None => KvStore::temporary()?,
        };
        let cache = Arc::new(LocalCacheStore::new(
            Arc::new(kv),
            CacheOptions {
                ttl_override: config.cache_ttl(),
                policy_ttl: config.cache_policy_ttl(),
                max_items: config.max_items,
            },
        ));
        cache.init().await?;

        let config = Arc::new(config);
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let scheduler = RepublishScheduler::new(config.republish.clone(), events.clone());
        let client = RemoteSyncClient::new(capabilities, cache, config.clone());

        info!("观看历史管理器已初始化: {:?}", client);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                client,
                scheduler,
                events,
                fingerprints: Mutex::new(HashMap::new()),
                refreshes: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &WatchHistoryConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &RemoteSyncClient {
        &self.inner.client
    }

    pub fn identity(&self) -> &IdentityResolver {
        self.inner.client.identity()
    }

    pub fn scheduler(&self) -> &RepublishScheduler {
        &self.inner.scheduler
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.inner.events
    }

    /// 订阅同步事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// 同步事件统计
    pub fn event_stats(&self) -> EventStats {
        self.inner.events.get_stats()
    }

    /// 更新观看历史列表
    ///
    /// 默认与缓存中的列表合并；`replace` 时以输入为准。之前存在、现在为空的月份
    /// 会发布空载荷以覆盖远端旧数据。
    pub async fn update_list(&self, items: Vec<Pointer>, options: UpdateOptions) -> Result<PublishReport> {
        let inner = &self.inner;
        let actor = self.identity().resolve_or_ensure(options.actor.as_deref()).await?;
        let cached = inner.client.cache().get(&actor).await;

        let incoming = items.len();
        let existing = cached
            .as_ref()
            .filter(|_| !options.replace)
            .map(|entry| entry.items.clone())
            .unwrap_or_default();
        let canonical = canonicalize_items(items.into_iter().chain(existing), inner.config.max_items);

        let mut records = bucket(canonical.clone());
        if let Some(entry) = &cached {
            for month in entry.records.months() {
                if !records.contains_month(month) {
                    records.insert_empty(month);
                }
            }
        }
        inner.track_fingerprint(&actor, &canonical);

        info!(
            actor = %actor,
            incoming,
            total = canonical.len(),
            replace = options.replace,
            "更新观看历史列表"
        );

        let snapshot_id = options
            .snapshot_id
            .clone()
            .or_else(|| cached.as_ref().and_then(|entry| entry.snapshot_id.clone()));
        let publish_options = PublishOptions {
            actor: Some(actor.clone()),
            snapshot_id,
            relays: options.relays.clone(),
        };
        let report = inner.client.publish_records(&records, &publish_options).await;

        let mut metadata = cached.as_ref().map(|e| e.metadata.clone()).unwrap_or_default();
        metadata.updated_at = Some(now_millis());
        metadata.status = if report.ok { CacheStatus::Ok } else { CacheStatus::Error };
        metadata.last_error = report.error.as_ref().map(|e| e.code().to_string());
        metadata.skipped_count = report.skipped_count;

        let entry = CacheEntry::new(actor.clone(), canonical)
            .with_snapshot_id(
                report
                    .snapshot_id
                    .clone()
                    .or_else(|| cached.as_ref().and_then(|e| e.snapshot_id.clone())),
            )
            .with_pointer_event(
                report
                    .pointer_event
                    .clone()
                    .or_else(|| cached.as_ref().and_then(|e| e.pointer_event.clone())),
            )
            .with_metadata(metadata);
        inner.client.cache().persist(&actor, entry).await?;

        inner.emit_snapshot(&actor, &report);
        self.arm_republish(&actor, records, publish_options_with(&report, options.relays), &report);
        Ok(report)
    }

    /// 删除一条记录，记录不存在时返回 `skipped`
    pub async fn remove_item<I: Into<PointerInput>>(&self, pointer: I, options: UpdateOptions) -> Result<PublishReport> {
        let decoder = self.identity().decoder().map(|d| &**d as &dyn IdentifierDecoder);
        let target = normalize_with(pointer, decoder)
            .ok_or_else(|| WatchHistoryError::InvalidPointer("无法识别的 pointer".to_string()))?;
        let actor = self.identity().resolve_or_ensure(options.actor.as_deref()).await?;
        let cached = self.inner.client.cache().get(&actor).await;

        let existing = cached.as_ref().map(|e| e.items.clone()).unwrap_or_default();
        let target_key = target.key();
        let filtered: Vec<Pointer> = existing
            .iter()
            .filter(|item| item.key() != target_key)
            .cloned()
            .collect();
        if filtered.len() == existing.len() {
            debug!("要删除的记录不存在: {}", target_key);
            return Ok(PublishReport {
                ok: true,
                skipped: true,
                actor: Some(actor),
                snapshot_id: cached.and_then(|e| e.snapshot_id),
                ..PublishReport::default()
            });
        }

        self.update_list(
            filtered,
            UpdateOptions {
                actor: Some(actor),
                replace: true,
                ..options
            },
        )
        .await
    }

    pub async fn fetch(&self, actor: Option<&str>, options: FetchOptions) -> Result<FetchResult> {
        self.inner.client.fetch(actor, options).await
    }

    pub async fn resolve(&self, actor: Option<&str>, options: FetchOptions) -> Result<Vec<Pointer>> {
        self.inner.client.resolve(actor, options).await
    }

    /// 直接发布一个分桶集合，不写缓存
    pub async fn publish_records(&self, records: &BucketSet, options: &PublishOptions) -> PublishReport {
        self.inner.client.publish_records(records, options).await
    }

    /// 规范化后发布一份快照，不写缓存
    pub async fn publish_snapshot(&self, items: Vec<Pointer>, options: &PublishOptions) -> PublishReport {
        let records = canonicalize(items, self.inner.config.max_items);
        self.inner.client.publish_records(&records, options).await
    }

    /// 计算指纹；`items` 为 None 时使用缓存中的列表。指纹变化时发出事件
    pub async fn get_fingerprint(&self, actor: Option<&str>, items: Option<&[Pointer]>) -> Result<String> {
        let actor = self.identity().resolve(actor)?;
        let items = match items {
            Some(items) => canonicalize_items(items.iter().cloned(), self.inner.config.max_items),
            None => self
                .inner
                .client
                .cache()
                .get(&actor)
                .await
                .map(|entry| entry.items)
                .unwrap_or_default(),
        };
        Ok(self.inner.track_fingerprint(&actor, &items))
    }

    /// 强制刷新；远端没有任何记录而本地有时，自动发布一次快照（每个 actor 只尝试一次）
    ///
    /// 同一 actor 的并发调用共享一次执行。
    pub async fn ensure_background_refresh(&self, actor: Option<&str>) -> Result<FetchResult> {
        let actor = self.identity().resolve(actor)?;
        let shared = {
            let mut refreshes = self.inner.refreshes.lock();
            match refreshes.get(&actor) {
                Some(existing) => existing.clone(),
                None => {
                    let manager = self.clone();
                    let key = actor.clone();
                    let future = async move {
                        let result = manager.run_background_refresh(&key).await;
                        manager.inner.refreshes.lock().remove(&key);
                        if let Err(e) = &result {
                            warn!("观看历史后台刷新失败: {}", e);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    refreshes.insert(actor.clone(), future.clone());
                    future
                }
            }
        };
        shared.await
    }

    async fn run_background_refresh(&self, actor: &str) -> Result<FetchResult> {
        let inner = &self.inner;
        let fetched = inner
            .client
            .fetch(
                Some(actor),
                FetchOptions {
                    force_refresh: true,
                    ..FetchOptions::default()
                },
            )
            .await?;
        // 只有确认远端为空时才自动发布
        if fetched.pointer_event.is_some() || fetched.source != FetchSource::Remote {
            return Ok(fetched);
        }

        let Some(entry) = inner.client.cache().get(actor).await else {
            return Ok(fetched);
        };
        if entry.items.is_empty() || entry.metadata.auto_snapshot_attempted {
            return Ok(fetched);
        }

        info!("远端没有观看历史，自动发布本地快照: {}", actor);
        let mut metadata = entry.metadata.clone();
        metadata.auto_snapshot_attempted = true;
        metadata.auto_snapshot_attempted_at = Some(now_millis());

        let records = bucket(entry.items.clone());
        let publish_options = PublishOptions {
            actor: Some(actor.to_string()),
            snapshot_id: entry.snapshot_id.clone(),
            relays: Vec::new(),
        };
        let report = inner.client.publish_records(&records, &publish_options).await;
        inner.track_fingerprint(actor, &entry.items);

        metadata.status = if report.ok { CacheStatus::Ok } else { CacheStatus::Error };
        metadata.last_error = report.error.as_ref().map(|e| e.code().to_string());
        let saved = inner
            .client
            .cache()
            .persist(
                actor,
                CacheEntry {
                    snapshot_id: report.snapshot_id.clone().or(entry.snapshot_id.clone()),
                    pointer_event: report.pointer_event.clone(),
                    metadata,
                    ..entry
                },
            )
            .await?;

        inner.emit_snapshot(actor, &report);
        self.arm_republish(actor, records, publish_options_with(&report, Vec::new()), &report);

        Ok(FetchResult {
            actor: actor.to_string(),
            items: saved.items,
            records: saved.records,
            snapshot_id: saved.snapshot_id,
            pointer_event: saved.pointer_event,
            source: FetchSource::Remote,
            decrypt_errors: saved.metadata.decrypt_errors,
        })
    }

    /// 取消重发任务；`task_id` 为 None 时取消全部
    pub fn cancel_republish(&self, task_id: Option<&str>) -> bool {
        match task_id {
            Some(task_id) => self.inner.scheduler.cancel(task_id),
            None => {
                self.inner.scheduler.cancel_all();
                true
            }
        }
    }

    /// 清空内存状态：重发任务、缓存、指纹与进行中的刷新
    pub async fn clear(&self) {
        self.inner.scheduler.cancel_all();
        self.inner.client.cache().reset().await;
        self.inner.fingerprints.lock().clear();
        self.inner.refreshes.lock().clear();
        info!("观看历史内存状态已清空");
    }

    /// 失败且可重试时布置重发任务（替换旧任务），其余情况取消旧任务
    ///
    /// 旧任务携带的是过期快照，不能在新结果之后再发布。
    fn arm_republish(&self, actor: &str, records: BucketSet, options: PublishOptions, report: &PublishReport) {
        let task_id = republish_task_id(actor);
        if report.ok || !report.retryable {
            if self.inner.scheduler.cancel(&task_id) {
                debug!("已取消过期的重发任务: {}", task_id);
            }
            return;
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let actor = actor.to_string();
        let records = Arc::new(records);
        let operation: RepublishOperation = Arc::new(move |attempt| {
            let weak = weak.clone();
            let actor = actor.clone();
            let records = records.clone();
            let options = options.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                debug!("重发观看历史快照 actor={} attempt={}", actor, attempt);
                let report = inner.client.publish_records(&records, &options).await;
                inner.record_republish(&actor, &report).await;
                inner.emit_snapshot(&actor, &report);
                report.into_result().map(|_| ())
            }
            .boxed()
        });

        if let Err(e) = self.inner.scheduler.schedule(&task_id, 0, operation) {
            warn!("无法布置重发任务: {}", e);
        }
    }
}

/// 重发时沿用首次发布的快照 ID
fn publish_options_with(report: &PublishReport, relays: Vec<String>) -> PublishOptions {
    PublishOptions {
        actor: report.actor.clone(),
        snapshot_id: report.snapshot_id.clone(),
        relays,
    }
}

impl ManagerInner {
    fn track_fingerprint(&self, actor: &str, items: &[Pointer]) -> String {
        let current = fingerprint(items);
        let previous = self
            .fingerprints
            .lock()
            .insert(actor.to_string(), current.clone());
        if let Some(previous) = previous.filter(|p| p != &current) {
            debug!("观看历史指纹变化: {}", actor);
            self.events.emit(SyncEvent::FingerprintChanged {
                actor: actor.to_string(),
                previous: Some(previous),
                current: current.clone(),
            });
        }
        current
    }

    fn emit_snapshot(&self, actor: &str, report: &PublishReport) {
        self.events.emit(SyncEvent::SnapshotCompleted {
            actor: actor.to_string(),
            ok: report.ok,
            retryable: report.retryable,
            error: report.error.as_ref().map(|e| e.code().to_string()),
        });
    }

    /// 重发结果写回缓存元数据
    async fn record_republish(&self, actor: &str, report: &PublishReport) {
        let Some(mut entry) = self.client.cache().get(actor).await else {
            return;
        };
        entry.metadata.updated_at = Some(now_millis());
        entry.metadata.status = if report.ok { CacheStatus::Ok } else { CacheStatus::Error };
        entry.metadata.last_error = report.error.as_ref().map(|e| e.code().to_string());
        if report.pointer_event.is_some() {
            entry.pointer_event = report.pointer_event.clone();
        }
        if let Err(e) = self.client.cache().persist(actor, entry).await {
            warn!("写入重发结果失败: {}", e);
        }
    }
}
