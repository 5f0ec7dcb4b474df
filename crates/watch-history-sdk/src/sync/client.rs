//! 远端同步客户端
//!
//! 每个月份发布为一条可替换的头记录（`d = YYYY-MM`），放不下的部分拆成分片记录，
//! 由头记录上的 `chunk` 坐标标签引用。发布要求所有 relay 都接受。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::codec::{
    fingerprint, looks_like_json, parse_payload, pointer_tags, pointers_from_tags, split_payloads,
    PAYLOAD_VERSION,
};
use crate::config::WatchHistoryConfig;
use crate::crypto::{EncryptionNegotiator, EncryptionScheme};
use crate::error::{Result, WatchHistoryError};
use crate::identity::{IdentityResolver, SigningContext};
use crate::network::{dedupe_relays, Filter, Record, RecordStream, UnsignedRecord};
use crate::pointer::{canonicalize_items, BucketSet, Pointer};
use crate::storage::{CacheEntry, CacheStatus, LocalCacheStore};
use crate::utils::time::{now_millis, MonotonicClock};

/// 发布选项
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// 显式 actor，缺省时按身份解析顺序决定
    pub actor: Option<String>,
    /// 复用的快照 ID，缺省时生成新的
    pub snapshot_id: Option<String>,
    /// 显式 relay 列表
    pub relays: Vec<String>,
}

/// 拉取选项
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// 忽略 TTL 内的缓存
    pub force_refresh: bool,
    pub relays: Vec<String>,
}

/// 单个 relay 的发布结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub relay: String,
    pub accepted: bool,
    pub error: Option<String>,
}

/// 单个月份的发布结果
#[derive(Debug, Clone)]
pub struct MonthPublishResult {
    pub month: String,
    pub snapshot_id: String,
    pub scheme: EncryptionScheme,
    /// 月份头记录
    pub head: Record,
    /// 分片记录（不含头记录）
    pub chunks: Vec<Record>,
    pub included: Vec<Pointer>,
    /// 单条超出预算被丢弃的 pointer
    pub skipped: Vec<Pointer>,
    pub relays: Vec<RelayOutcome>,
}

/// `publish_records` 中每个月份的结果
#[derive(Debug, Clone)]
pub struct MonthReport {
    pub month: String,
    pub ok: bool,
    pub error: Option<WatchHistoryError>,
    pub result: Option<MonthPublishResult>,
}

/// 一次快照发布的聚合结果
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub ok: bool,
    pub retryable: bool,
    pub error: Option<WatchHistoryError>,
    pub actor: Option<String>,
    pub snapshot_id: Option<String>,
    /// 最新月份的头记录
    pub pointer_event: Option<Record>,
    pub skipped_count: usize,
    /// 没有需要发布的变更，未访问网络
    pub skipped: bool,
    pub results: Vec<MonthReport>,
}

impl PublishReport {
    pub fn failed(error: WatchHistoryError, actor: Option<String>, snapshot_id: Option<String>) -> Self {
        Self {
            ok: false,
            retryable: error.is_retryable(),
            error: Some(error),
            actor,
            snapshot_id,
            ..Self::default()
        }
    }

    /// 转为 `Result`，供重发调度器判断是否继续
    pub fn into_result(self) -> Result<Self> {
        match (&self.error, self.ok) {
            (Some(error), false) => Err(error.clone()),
            _ => Ok(self),
        }
    }
}

/// 拉取结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// TTL 内的本地缓存，未访问网络
    Cache,
    Remote,
    /// 远端全部失败，退回本地缓存
    CacheFallback,
}

/// 拉取结果
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub actor: String,
    pub items: Vec<Pointer>,
    pub records: BucketSet,
    pub snapshot_id: Option<String>,
    /// 远端最新的月份头记录，远端没有记录时为 None
    pub pointer_event: Option<Record>,
    pub source: FetchSource,
    pub decrypt_errors: usize,
}

impl FetchResult {
    fn from_cache(entry: CacheEntry, source: FetchSource) -> Self {
        Self {
            actor: entry.actor,
            items: entry.items,
            records: entry.records,
            snapshot_id: entry.snapshot_id,
            pointer_event: entry.pointer_event,
            source,
            decrypt_errors: entry.metadata.decrypt_errors,
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchResult>>>;

/// 远端解码后的快照
struct RemoteSnapshot {
    items: Vec<Pointer>,
    snapshot_id: Option<String>,
    head: Record,
    decrypt_errors: usize,
}

struct ClientInner {
    capabilities: Capabilities,
    negotiator: EncryptionNegotiator,
    identity: IdentityResolver,
    cache: Arc<LocalCacheStore>,
    config: Arc<WatchHistoryConfig>,
    clock: MonotonicClock,
    inflight: Mutex<HashMap<String, SharedFetch>>,
}

/// 远端同步客户端
#[derive(Clone)]
pub struct RemoteSyncClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RemoteSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSyncClient")
            .field("capabilities", &self.inner.capabilities)
            .field("inflight", &self.inner.inflight.lock().len())
            .finish()
    }
}

/// 生成新的快照 ID
pub fn new_snapshot_id() -> String {
    Uuid::new_v4().to_string()
}

/// 分片记录的 `d` 标识
pub fn chunk_identifier(month: &str, index: usize) -> String {
    format!("{}:chunk:{}", month, index)
}

/// 从 `kind:pubkey:d` 坐标中取出分片标识，kind 与作者不符时返回 None
fn chunk_identifier_from_coordinate(coordinate: &str, kind: u32, actor: &str) -> Option<String> {
    let mut parts = coordinate.splitn(3, ':');
    let coord_kind = parts.next()?.parse::<u32>().ok()?;
    let pubkey = parts.next()?;
    let identifier = parts.next()?;
    if coord_kind != kind || !pubkey.eq_ignore_ascii_case(actor) || identifier.is_empty() {
        return None;
    }
    Some(identifier.to_string())
}

/// 进行中拉取的键：actor 加排序去重后的显式 relay
fn inflight_key(actor: &str, relays: &[String]) -> String {
    let mut relays = dedupe_relays(relays);
    relays.sort();
    if relays.is_empty() {
        actor.to_string()
    } else {
        format!("{}|{}", actor, relays.join(","))
    }
}

/// 记录的 kind 与作者是否匹配
fn is_own_record(record: &Record, kind: u32, actor: &str) -> bool {
    record.kind == kind && record.pubkey.eq_ignore_ascii_case(actor)
}

/// 按 `d` 标识保留最新的记录（created_at 降序，相同时 id 升序）
fn latest_by_identifier<I>(records: I) -> BTreeMap<String, Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut latest: BTreeMap<String, Record> = BTreeMap::new();
    for record in records {
        let Some(identifier) = record.identifier().map(String::from) else {
            continue;
        };
        match latest.get(&identifier) {
            Some(existing)
                if existing.created_at > record.created_at
                    || (existing.created_at == record.created_at && existing.id <= record.id) => {}
            _ => {
                latest.insert(identifier, record);
            }
        }
    }
    latest
}

impl RemoteSyncClient {
    pub fn new(
        capabilities: Capabilities,
        cache: Arc<LocalCacheStore>,
        config: Arc<WatchHistoryConfig>,
    ) -> Self {
        let negotiator = EncryptionNegotiator::new(capabilities.toolkit.clone());
        let identity = IdentityResolver::new(&capabilities);
        Self {
            inner: Arc::new(ClientInner {
                capabilities,
                negotiator,
                identity,
                cache,
                config,
                clock: MonotonicClock::new(),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.inner.identity
    }

    pub fn cache(&self) -> &Arc<LocalCacheStore> {
        &self.inner.cache
    }

    pub fn config(&self) -> &WatchHistoryConfig {
        &self.inner.config
    }

    /// 最近一次发布使用的 `created_at`
    pub fn last_created_at(&self) -> i64 {
        self.inner.clock.last()
    }

    /// 写入用 relay：显式 > 目录写 relay > 目录回退 relay > 配置默认
    pub fn write_relays(&self, explicit: &[String]) -> Vec<String> {
        self.inner.select_relays(explicit, true)
    }

    /// 读取用 relay：显式 > 目录读 relay > 目录回退 relay > 配置默认
    pub fn read_relays(&self, explicit: &[String]) -> Vec<String> {
        self.inner.select_relays(explicit, false)
    }

    /// 发布单个月份
    pub async fn publish_month(
        &self,
        actor: &str,
        month: &str,
        pointers: &[Pointer],
        options: &PublishOptions,
    ) -> Result<MonthPublishResult> {
        let actor = self
            .inner
            .identity
            .normalize(actor)
            .ok_or(WatchHistoryError::MissingActor)?;
        let ctx = self.inner.identity.signing_context(&actor).await?;
        let snapshot_id = options.snapshot_id.clone().unwrap_or_else(new_snapshot_id);
        let relays = self.write_relays(&options.relays);
        self.inner
            .publish_month_with(&ctx, &actor, month, pointers, &snapshot_id, &relays)
            .await
    }

    /// 按月份顺序依次发布整个分桶集合
    pub async fn publish_records(&self, records: &BucketSet, options: &PublishOptions) -> PublishReport {
        let actor = match self.inner.identity.resolve_or_ensure(options.actor.as_deref()).await {
            Ok(actor) => actor,
            Err(e) => {
                warn!("无法确定发布身份: {}", e);
                return PublishReport::failed(e, None, options.snapshot_id.clone());
            }
        };
        let snapshot_id = options.snapshot_id.clone().unwrap_or_else(new_snapshot_id);
        let ctx = match self.inner.identity.signing_context(&actor).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("无法获取签名上下文 actor={}: {}", actor, e);
                return PublishReport::failed(e, Some(actor), Some(snapshot_id));
            }
        };
        let relays = self.write_relays(&options.relays);

        let mut results = Vec::with_capacity(records.len());
        for (month, pointers) in records.iter() {
            match self
                .inner
                .publish_month_with(&ctx, &actor, month, pointers, &snapshot_id, &relays)
                .await
            {
                Ok(result) => results.push(MonthReport {
                    month: month.clone(),
                    ok: true,
                    error: None,
                    result: Some(result),
                }),
                Err(e) => {
                    warn!("月份 {} 发布失败: {}", month, e);
                    results.push(MonthReport {
                        month: month.clone(),
                        ok: false,
                        error: Some(e),
                        result: None,
                    });
                }
            }
        }

        let errors: Vec<&WatchHistoryError> = results.iter().filter_map(|r| r.error.as_ref()).collect();
        let ok = errors.is_empty();
        let retryable = !ok && errors.iter().all(|e| e.is_retryable());
        let error = errors.first().map(|e| (*e).clone());
        let pointer_event = results
            .iter()
            .rev()
            .find_map(|r| r.result.as_ref().map(|m| m.head.clone()));
        let skipped_count = results
            .iter()
            .filter_map(|r| r.result.as_ref())
            .map(|m| m.skipped.len())
            .sum();

        info!(
            actor = %actor,
            snapshot_id = %snapshot_id,
            months = results.len(),
            ok,
            retryable,
            "观看历史快照发布完成"
        );

        PublishReport {
            ok,
            retryable,
            error,
            actor: Some(actor),
            snapshot_id: Some(snapshot_id),
            pointer_event,
            skipped_count,
            skipped: false,
            results,
        }
    }

    /// 拉取远端观看历史，TTL 内的缓存直接返回，同一 actor 的并发请求共享一次拉取
    pub async fn fetch(&self, actor: Option<&str>, options: FetchOptions) -> Result<FetchResult> {
        let actor = self.inner.identity.resolve(actor)?;
        if let Some(entry) = self.inner.cache.fresh(&actor, options.force_refresh).await {
            debug!("观看历史缓存命中: {}", actor);
            return Ok(FetchResult::from_cache(entry, FetchSource::Cache));
        }

        let shared = {
            let key = inflight_key(&actor, &options.relays);
            let mut inflight = self.inner.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => {
                    debug!("复用进行中的拉取: {}", actor);
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let owner = actor.clone();
                    let slot = key.clone();
                    let relays = options.relays.clone();
                    let future = async move {
                        let result = inner.fetch_remote(&owner, &relays).await;
                        inner.inflight.lock().remove(&slot);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, future.clone());
                    future
                }
            }
        };
        shared.await
    }

    /// 拉取并与本地缓存合并，结果不会少于缓存中已有的条目
    ///
    /// 缓存保存完整的合并集合，返回值按批量上限截断。
    pub async fn resolve(&self, actor: Option<&str>, options: FetchOptions) -> Result<Vec<Pointer>> {
        let actor = self.inner.identity.resolve(actor)?;
        let cached_items = self
            .inner
            .cache
            .get(&actor)
            .await
            .map(|entry| entry.items)
            .unwrap_or_default();
        let fetched = self.fetch(Some(&actor), options).await?;

        let max_items = self.inner.config.max_items;
        let merged = canonicalize_items(
            fetched.items.iter().cloned().chain(cached_items),
            max_items,
        );

        if fingerprint(&merged) != fingerprint(&fetched.items) {
            let base = self
                .inner
                .cache
                .get(&actor)
                .await
                .unwrap_or_else(|| CacheEntry::new(actor.clone(), Vec::new()));
            let entry = CacheEntry {
                records: BucketSet::new(),
                items: merged.clone(),
                ..base
            };
            if let Err(e) = self.inner.cache.persist(&actor, entry).await {
                warn!("写入合并后的观看历史缓存失败: {}", e);
            }
        }

        let limit = self.inner.config.resolve_limit();
        let mut items = merged;
        if limit > 0 {
            items.truncate(limit);
        }
        Ok(items)
    }

    /// 订阅 actor 的月份头记录，传输层不支持订阅时返回 None
    pub async fn subscribe(&self, actor: Option<&str>) -> Result<Option<RecordStream>> {
        let actor = self.inner.identity.resolve(actor)?;
        let transport = self
            .inner
            .capabilities
            .transport
            .clone()
            .ok_or(WatchHistoryError::TransportUninitialized)?;
        let relays = self.read_relays(&[]);
        let filter = Filter::new()
            .kind(self.inner.config.kind)
            .author(actor.clone())
            .tag("v", [PAYLOAD_VERSION.to_string()]);
        let stream = transport.subscribe(&relays, &[filter]).await?;
        if stream.is_none() {
            debug!("传输层不支持订阅: {}", actor);
        }
        Ok(stream)
    }
}

impl ClientInner {
    fn select_relays(&self, explicit: &[String], write: bool) -> Vec<String> {
        let explicit = dedupe_relays(explicit);
        if !explicit.is_empty() {
            return explicit;
        }
        if let Some(directory) = &self.capabilities.relays {
            let primary = if write {
                directory.write_relays()
            } else {
                directory.read_relays()
            };
            let primary = dedupe_relays(primary);
            if !primary.is_empty() {
                return primary;
            }
            let fallback = dedupe_relays(directory.fallback_relays());
            if !fallback.is_empty() {
                return fallback;
            }
        }
        dedupe_relays(&self.config.default_relays)
    }

    fn record_tags(
        &self,
        identifier: &str,
        month: &str,
        snapshot_id: &str,
        scheme: EncryptionScheme,
        included: &[Pointer],
    ) -> Vec<Vec<String>> {
        let mut tags = vec![vec!["d".to_string(), identifier.to_string()]];
        if identifier == month {
            tags.push(vec!["v".to_string(), PAYLOAD_VERSION.to_string()]);
        }
        tags.push(vec!["snapshot".to_string(), snapshot_id.to_string()]);
        tags.push(vec!["month".to_string(), month.to_string()]);
        tags.push(vec!["encrypted".to_string(), scheme.as_tag().to_string()]);
        if self.config.public_pointer_tags {
            tags.extend(pointer_tags(included));
        }
        tags
    }

    async fn publish_month_with(
        &self,
        ctx: &SigningContext,
        actor: &str,
        month: &str,
        pointers: &[Pointer],
        snapshot_id: &str,
        relays: &[String],
    ) -> Result<MonthPublishResult> {
        let transport = self
            .capabilities
            .transport
            .clone()
            .ok_or(WatchHistoryError::TransportUninitialized)?;

        // 会话身份发布的条目需要标记来源
        let session = ctx.is_session();
        let pointers: Vec<Pointer> = pointers
            .iter()
            .cloned()
            .map(|p| if session { p.with_session(true) } else { p })
            .collect();

        let split = split_payloads(month, &pointers, self.config.payload_max_bytes);
        let total = split.chunks.len();

        let mut encrypted = Vec::with_capacity(total);
        for chunk in &split.chunks {
            let plaintext = chunk.payload.to_json()?;
            encrypted.push(self.negotiator.encrypt(ctx, actor, &plaintext).await?);
        }
        let head_scheme = encrypted
            .first()
            .map(|(_, scheme)| *scheme)
            .unwrap_or(EncryptionScheme::Nip44V2);

        // 分片先签名，头记录的 created_at 最大
        let mut chunks = Vec::with_capacity(total.saturating_sub(1));
        for (index, (chunk, (ciphertext, scheme))) in
            split.chunks.iter().zip(encrypted.iter()).enumerate().skip(1)
        {
            let identifier = chunk_identifier(month, index);
            let unsigned = UnsignedRecord {
                pubkey: actor.to_string(),
                created_at: self.clock.next(),
                kind: self.config.kind,
                tags: self.record_tags(&identifier, month, snapshot_id, *scheme, &chunk.included),
                content: ciphertext.clone(),
            };
            chunks.push(self.negotiator.sign(ctx, unsigned).await?);
        }

        let head_included: &[Pointer] = split
            .chunks
            .first()
            .map(|chunk| chunk.included.as_slice())
            .unwrap_or(&[]);
        let mut head_tags = self.record_tags(month, month, snapshot_id, head_scheme, head_included);
        for index in 1..total {
            head_tags.push(vec![
                "chunk".to_string(),
                format!("{}:{}:{}", self.config.kind, actor, chunk_identifier(month, index)),
            ]);
        }
        let head_content = encrypted
            .first()
            .map(|(ciphertext, _)| ciphertext.clone())
            .unwrap_or_default();
        let head = self
            .negotiator
            .sign(
                ctx,
                UnsignedRecord {
                    pubkey: actor.to_string(),
                    created_at: self.clock.next(),
                    kind: self.config.kind,
                    tags: head_tags,
                    content: head_content,
                },
            )
            .await?;

        if relays.is_empty() {
            warn!("没有可用的 relay，月份 {} 无法发布", month);
            return Err(WatchHistoryError::PublishRejected);
        }

        let mut records: Vec<Record> = chunks.clone();
        records.push(head.clone());
        let outcomes: Vec<RelayOutcome> = join_all(relays.iter().map(|relay| {
            let transport = transport.clone();
            let records = &records;
            async move {
                for record in records {
                    if let Err(e) = transport.publish(relay, record).await {
                        debug!("relay {} 拒绝记录 {}: {}", relay, record.id, e);
                        return RelayOutcome {
                            relay: relay.clone(),
                            accepted: false,
                            error: Some(e.to_string()),
                        };
                    }
                }
                RelayOutcome {
                    relay: relay.clone(),
                    accepted: true,
                    error: None,
                }
            }
        }))
        .await;

        let accepted = outcomes.iter().filter(|o| o.accepted).count();
        info!(
            month = %month,
            chunks = total,
            accepted,
            relays = relays.len(),
            "观看历史月份记录已发布"
        );
        if accepted == 0 {
            return Err(WatchHistoryError::PublishRejected);
        }
        if accepted < outcomes.len() {
            return Err(WatchHistoryError::PartialRelayAcceptance {
                accepted,
                total: outcomes.len(),
            });
        }

        let included = split
            .chunks
            .iter()
            .flat_map(|chunk| chunk.included.iter().cloned())
            .collect();
        Ok(MonthPublishResult {
            month: month.to_string(),
            snapshot_id: snapshot_id.to_string(),
            scheme: head_scheme,
            head,
            chunks,
            included,
            skipped: split.skipped,
            relays: outcomes,
        })
    }

    /// 解码单条记录：优先使用解密后的载荷，失败或为空时退回公开标签
    async fn decode_record(
        &self,
        ctx: Option<&SigningContext>,
        actor: &str,
        record: &Record,
    ) -> (Vec<Pointer>, bool) {
        let fallback = pointers_from_tags(&record.tags);
        let content = record.content.trim();
        if content.is_empty() {
            return (fallback, false);
        }

        let mut decrypt_failed = false;
        let plaintext = if looks_like_json(content) {
            Some(content.to_string())
        } else if let Some(ctx) = ctx {
            match self
                .negotiator
                .decrypt(ctx, actor, content, record.tag_value("encrypted"))
                .await
            {
                Ok((plaintext, scheme)) => {
                    debug!("记录 {} 使用 {} 解密成功", record.id, scheme.as_tag());
                    Some(plaintext)
                }
                Err(e) => {
                    debug!("记录 {} 解密失败: {}", record.id, e);
                    decrypt_failed = true;
                    None
                }
            }
        } else {
            decrypt_failed = true;
            None
        };

        match plaintext.as_deref().and_then(parse_payload) {
            Some(parsed) if !parsed.items.is_empty() => (parsed.items, decrypt_failed),
            _ => (fallback, decrypt_failed),
        }
    }

    /// 从 relay 拉取；远端没有任何头记录时返回 None
    async fn fetch_snapshot(&self, actor: &str, explicit: &[String]) -> Result<Option<RemoteSnapshot>> {
        let transport = self
            .capabilities
            .transport
            .clone()
            .ok_or(WatchHistoryError::TransportUninitialized)?;
        let relays = self.select_relays(explicit, false);
        if relays.is_empty() {
            return Err(WatchHistoryError::Transport("没有可用的 relay".to_string()));
        }

        let kind = self.config.kind;
        let head_filter = Filter::new()
            .kind(kind)
            .author(actor.to_string())
            .tag("v", [PAYLOAD_VERSION.to_string()])
            .limit(self.config.fetch_event_limit);
        let listed = transport.list(&relays, &[head_filter]).await?;
        let limit = self.config.fetch_event_limit;
        if listed.len() >= limit {
            warn!(
                "头记录数量达到上限 {}，更早的月份可能未被拉取: {}",
                limit, actor
            );
        }
        let heads = latest_by_identifier(
            listed
                .into_iter()
                .filter(|r| is_own_record(r, kind, actor)),
        );
        let Some(newest) = heads
            .values()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| b.id.cmp(&a.id)))
            .cloned()
        else {
            return Ok(None);
        };

        let chunk_ids: Vec<String> = heads
            .values()
            .flat_map(|head| {
                head.tag_values("chunk")
                    .filter_map(|coordinate| chunk_identifier_from_coordinate(coordinate, kind, actor))
                    .collect::<Vec<_>>()
            })
            .collect();
        let chunks = if chunk_ids.is_empty() {
            BTreeMap::new()
        } else {
            let filter = Filter::new()
                .kind(kind)
                .author(actor.to_string())
                .tag("d", chunk_ids.clone());
            match transport.list(&relays, &[filter]).await {
                Ok(records) => latest_by_identifier(
                    records
                        .into_iter()
                        .filter(|r| is_own_record(r, kind, actor)),
                ),
                Err(e) => {
                    warn!("拉取观看历史分片失败，仅使用头记录: {}", e);
                    BTreeMap::new()
                }
            }
        };
        if chunks.len() < chunk_ids.len() {
            debug!("部分分片缺失: {}/{}", chunks.len(), chunk_ids.len());
        }

        let ctx = self.identity.decryption_context(actor);
        let mut pointers = Vec::new();
        let mut decrypt_errors = 0;
        for record in heads.values().chain(chunks.values()) {
            let (items, failed) = self.decode_record(ctx.as_ref(), actor, record).await;
            if failed {
                decrypt_errors += 1;
            }
            pointers.extend(items);
        }

        let items = canonicalize_items(pointers, self.config.max_items);
        if items.is_empty() && decrypt_errors > 0 {
            return Err(WatchHistoryError::DecryptionFailed(format!(
                "{} 条记录无法解密且没有公开标签",
                decrypt_errors
            )));
        }

        Ok(Some(RemoteSnapshot {
            items,
            snapshot_id: newest.tag_value("snapshot").map(String::from),
            head: newest,
            decrypt_errors,
        }))
    }

    async fn fetch_remote(&self, actor: &str, explicit: &[String]) -> Result<FetchResult> {
        let cached = self.cache.get(actor).await;
        let now = now_millis();

        match self.fetch_snapshot(actor, explicit).await {
            Ok(Some(remote)) => {
                let mut metadata = cached
                    .as_ref()
                    .map(|entry| entry.metadata.clone())
                    .unwrap_or_default();
                metadata.status = if remote.decrypt_errors > 0 {
                    CacheStatus::Partial
                } else {
                    CacheStatus::Ok
                };
                metadata.last_error = None;
                metadata.last_fetched_at = Some(now);
                metadata.decrypt_errors = remote.decrypt_errors;

                let entry = CacheEntry::new(actor, remote.items)
                    .with_snapshot_id(remote.snapshot_id)
                    .with_pointer_event(Some(remote.head))
                    .with_metadata(metadata);
                let entry = match self.cache.persist(actor, entry.clone()).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        warn!("写入观看历史缓存失败: {}", e);
                        entry
                    }
                };
                info!(actor = %actor, items = entry.items.len(), "观看历史已从远端拉取");
                Ok(FetchResult::from_cache(entry, FetchSource::Remote))
            }
            Ok(None) => {
                debug!("远端没有观看历史记录: {}", actor);
                let mut entry = cached.unwrap_or_else(|| CacheEntry::new(actor, Vec::new()));
                entry.metadata.last_fetched_at = Some(now);
                if !entry.items.is_empty() {
                    match self.cache.persist(actor, entry.clone()).await {
                        Ok(saved) => entry = saved,
                        Err(e) => warn!("写入观看历史缓存失败: {}", e),
                    }
                }
                let mut result = FetchResult::from_cache(entry, FetchSource::Remote);
                result.actor = actor.to_string();
                result.pointer_event = None;
                Ok(result)
            }
            Err(e) => match cached {
                Some(entry) => {
                    warn!("拉取观看历史失败，使用本地缓存: {}", e);
                    Ok(FetchResult::from_cache(entry, FetchSource::CacheFallback))
                }
                None => Err(e),
            },
        }
    }
}
