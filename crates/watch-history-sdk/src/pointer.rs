//! Pointer 规范化模块
//!
//! 负责把各种形态的输入（标签三元组、对象、JSON、编码标识符）
//! 解析为统一的 [`Pointer`]，并完成去重、合并、排序、截断与按月分桶。
//!
//! 规范化是纯函数：对任意输入顺序结果相同，且重复规范化结果不变。

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::network::{DecodedIdentifier, IdentifierDecoder};
use crate::utils::time::{month_key, normalize_timestamp_secs, now_secs};

/// Pointer 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PointerType {
    /// 直接引用（事件 ID）
    #[serde(rename = "e")]
    Event,
    /// 可寻址坐标（`kind:pubkey:identifier`）
    #[serde(rename = "a")]
    Address,
}

impl PointerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerType::Event => "e",
            PointerType::Address => "a",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "e" => Some(PointerType::Event),
            "a" => Some(PointerType::Address),
            _ => None,
        }
    }
}

/// 一条观看记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pointer {
    #[serde(rename = "type")]
    pub kind: PointerType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    /// 观看时间（UTC 秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_at: Option<i64>,
    /// 续播位置（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    /// 是否由临时会话身份发布
    #[serde(default, skip_serializing_if = "is_false")]
    pub session: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Pointer {
    pub fn new<S: Into<String>>(kind: PointerType, value: S) -> Self {
        Self {
            kind,
            value: value.into(),
            relay: None,
            watched_at: None,
            resume_at: None,
            completed: false,
            session: false,
        }
    }

    pub fn event<S: Into<String>>(id: S) -> Self {
        Self::new(PointerType::Event, id)
    }

    pub fn address<S: Into<String>>(coordinate: S) -> Self {
        Self::new(PointerType::Address, coordinate)
    }

    pub fn with_watched_at(mut self, watched_at: i64) -> Self {
        self.watched_at = Some(watched_at);
        self
    }

    pub fn with_relay<S: Into<String>>(mut self, relay: S) -> Self {
        self.relay = Some(relay.into());
        self
    }

    pub fn with_resume_at(mut self, resume_at: i64) -> Self {
        self.resume_at = Some(resume_at);
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    pub fn with_session(mut self, session: bool) -> Self {
        self.session = session;
        self
    }

    /// 唯一标识，见 [`pointer_key`]
    pub fn key(&self) -> String {
        pointer_key(self)
    }

    /// 缺失时按 0 处理的观看时间
    pub fn watched_at_or_zero(&self) -> i64 {
        self.watched_at.unwrap_or(0)
    }

    /// 转为公开 pointer 标签 `["e"|"a", value, relay?]`
    pub fn to_tag(&self) -> Vec<String> {
        let mut tag = vec![self.kind.as_str().to_string(), self.value.clone()];
        if let Some(relay) = &self.relay {
            tag.push(relay.clone());
        }
        tag
    }
}

/// `lower(type) + ":" + lower(trim(value))`
pub fn pointer_key(pointer: &Pointer) -> String {
    format!(
        "{}:{}",
        pointer.kind.as_str(),
        pointer.value.trim().to_lowercase()
    )
}

/// Pointer 的原始输入形态
#[derive(Debug, Clone)]
pub enum PointerInput {
    /// 标签三元组 `["e", id, relay?]`
    Tag(Vec<String>),
    /// 已是结构化对象，仍需清洗
    Pointer(Pointer),
    /// 编码标识符或裸值
    Text(String),
    /// 宽松的 JSON 对象 / 数组 / 字符串
    Json(Value),
}

impl From<Pointer> for PointerInput {
    fn from(pointer: Pointer) -> Self {
        PointerInput::Pointer(pointer)
    }
}

impl From<&str> for PointerInput {
    fn from(value: &str) -> Self {
        PointerInput::Text(value.to_string())
    }
}

impl From<String> for PointerInput {
    fn from(value: String) -> Self {
        PointerInput::Text(value)
    }
}

impl From<Vec<String>> for PointerInput {
    fn from(tag: Vec<String>) -> Self {
        PointerInput::Tag(tag)
    }
}

impl From<Value> for PointerInput {
    fn from(value: Value) -> Self {
        PointerInput::Json(value)
    }
}

/// 解析任意输入为 Pointer，无效输入返回 None
pub fn normalize<I: Into<PointerInput>>(input: I) -> Option<Pointer> {
    normalize_with(input, None)
}

/// 同 [`normalize`]，可借助解码器处理 `nevent` / `naddr`
pub fn normalize_with<I: Into<PointerInput>>(
    input: I,
    decoder: Option<&dyn IdentifierDecoder>,
) -> Option<Pointer> {
    match input.into() {
        PointerInput::Tag(tag) => normalize_tag(tag.as_slice()),
        PointerInput::Pointer(pointer) => sanitize(pointer),
        PointerInput::Text(text) => normalize_text(&text, decoder),
        PointerInput::Json(value) => normalize_json(&value, decoder),
    }
}

/// 解析标签三元组，标签名必须是 `e` 或 `a`
pub fn normalize_tag<S: AsRef<str>>(tag: &[S]) -> Option<Pointer> {
    if tag.len() < 2 {
        return None;
    }
    let kind = PointerType::parse(tag[0].as_ref())?;
    let value = tag[1].as_ref().trim();
    if value.is_empty() {
        return None;
    }
    let mut pointer = Pointer::new(kind, value);
    pointer.relay = tag.get(2).and_then(|r| non_empty(r.as_ref()));
    Some(pointer)
}

fn sanitize(pointer: Pointer) -> Option<Pointer> {
    let value = pointer.value.trim();
    if value.is_empty() {
        return None;
    }
    Some(Pointer {
        kind: pointer.kind,
        value: value.to_string(),
        relay: pointer.relay.as_deref().and_then(non_empty),
        watched_at: pointer.watched_at.map(|t| t.max(0)),
        resume_at: pointer.resume_at.map(|t| t.max(0)),
        completed: pointer.completed,
        session: pointer.session,
    })
}

fn normalize_text(text: &str, decoder: Option<&dyn IdentifierDecoder>) -> Option<Pointer> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("naddr") || trimmed.starts_with("nevent") {
        if let Some(decoded) = decoder.and_then(|d| d.decode(trimmed)) {
            match decoded {
                DecodedIdentifier::Address {
                    kind,
                    pubkey,
                    identifier,
                    relays,
                } => {
                    let mut pointer =
                        Pointer::address(format!("{}:{}:{}", kind, pubkey, identifier));
                    pointer.relay = relays.first().and_then(|r| non_empty(r));
                    return Some(pointer);
                }
                DecodedIdentifier::Event { id, relays } => {
                    if let Some(id) = non_empty(&id) {
                        let mut pointer = Pointer::event(id);
                        pointer.relay = relays.first().and_then(|r| non_empty(r));
                        return Some(pointer);
                    }
                }
                DecodedIdentifier::Pubkey(_) => {}
            }
        }
    }
    let kind = if trimmed.contains(':') {
        PointerType::Address
    } else {
        PointerType::Event
    };
    Some(Pointer::new(kind, trimmed))
}

fn normalize_json(value: &Value, decoder: Option<&dyn IdentifierDecoder>) -> Option<Pointer> {
    match value {
        Value::Array(items) => {
            let tag: Vec<String> = items
                .iter()
                .map(|item| item.as_str().unwrap_or_default().to_string())
                .collect();
            normalize_tag(tag.as_slice())
        }
        Value::String(text) => normalize_text(text, decoder),
        Value::Object(map) => {
            if let (Some(kind), Some(raw)) = (
                map.get("type").and_then(Value::as_str),
                map.get("value").and_then(Value::as_str),
            ) {
                let kind = if kind == "a" {
                    PointerType::Address
                } else {
                    PointerType::Event
                };
                let mut pointer = Pointer::new(kind, raw);
                pointer.relay = map.get("relay").and_then(Value::as_str).map(String::from);
                pointer.watched_at = map.get("watchedAt").and_then(json_int);
                pointer.resume_at = map.get("resumeAt").and_then(json_int);
                pointer.completed = map.get("completed").and_then(Value::as_bool) == Some(true);
                pointer.session = map.get("session").and_then(Value::as_bool) == Some(true);
                return sanitize(pointer);
            }
            match map.get("tag") {
                Some(tag @ Value::Array(_)) => normalize_json(tag, decoder),
                _ => None,
            }
        }
        _ => None,
    }
}

fn json_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f.floor() as i64))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// 取第一个有效的观看时间（毫秒自动换算为秒），都无效时取当前时间
pub fn normalize_watched_at(candidates: &[Option<i64>]) -> i64 {
    candidates
        .iter()
        .flatten()
        .find_map(|value| normalize_timestamp_secs(*value))
        .unwrap_or_else(now_secs)
}

/// 按月分桶的 pointer 集合，键为 UTC `YYYY-MM`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketSet(BTreeMap<String, Vec<Pointer>>);

impl BucketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 月份键（升序）
    pub fn months(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn get(&self, month: &str) -> Option<&Vec<Pointer>> {
        self.0.get(month)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&String, &Vec<Pointer>)> {
        self.0.iter()
    }

    pub fn contains_month(&self, month: &str) -> bool {
        self.0.contains_key(month)
    }

    /// 保留一个空月份占位，用于清空远端的旧月份
    pub fn insert_empty(&mut self, month: &str) {
        self.0.entry(month.to_string()).or_default();
    }

    /// 月份数量（含空月份）
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// pointer 总数
    pub fn item_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// 展平为规范顺序的列表（去重）
    pub fn items(&self) -> Vec<Pointer> {
        canonicalize_items(self.0.values().flatten().cloned(), 0)
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<Pointer>> {
        self.0
    }
}

impl FromIterator<(String, Vec<Pointer>)> for BucketSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<Pointer>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 规范化为按月分桶的集合
///
/// `max_items` 为 0 时不截断。
pub fn canonicalize<I>(pointers: I, max_items: usize) -> BucketSet
where
    I: IntoIterator<Item = Pointer>,
{
    bucket(canonicalize_items(pointers, max_items))
}

/// 规范化为扁平列表：去重合并，按观看时间降序、key 升序排列，截断到 `max_items`
pub fn canonicalize_items<I>(pointers: I, max_items: usize) -> Vec<Pointer>
where
    I: IntoIterator<Item = Pointer>,
{
    let mut groups: HashMap<String, Vec<Pointer>> = HashMap::new();
    for pointer in pointers.into_iter().filter_map(sanitize) {
        groups.entry(pointer_key(&pointer)).or_default().push(pointer);
    }

    let mut merged: Vec<Pointer> = groups.into_values().filter_map(merge_group).collect();
    merged.sort_by(canonical_order);
    if max_items > 0 {
        merged.truncate(max_items);
    }
    merged
}

/// 把规范列表分配到月份桶中，桶内保持输入顺序
pub fn bucket(items: Vec<Pointer>) -> BucketSet {
    let mut buckets: BTreeMap<String, Vec<Pointer>> = BTreeMap::new();
    for pointer in items {
        buckets
            .entry(month_key(pointer.watched_at_or_zero()))
            .or_default()
            .push(pointer);
    }
    BucketSet(buckets)
}

/// 观看时间降序，key 升序
pub fn canonical_order(a: &Pointer, b: &Pointer) -> Ordering {
    b.watched_at_or_zero()
        .cmp(&a.watched_at_or_zero())
        .then_with(|| pointer_key(a).cmp(&pointer_key(b)))
}

/// 同 key 的一组 pointer 先按确定顺序排列再折叠，结果与输入顺序无关
fn merge_group(mut group: Vec<Pointer>) -> Option<Pointer> {
    group.sort_by_key(|p| {
        (
            Reverse(p.watched_at_or_zero()),
            p.relay.is_none(),
            p.relay.clone(),
            Reverse(p.resume_at),
            !p.completed,
            !p.session,
            p.value.clone(),
        )
    });
    let mut iter = group.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, merge_pointer))
}

/// 合并两条同 key 的记录，`primary` 的观看时间不小于 `other`
fn merge_pointer(primary: Pointer, other: Pointer) -> Pointer {
    let tie = primary.watched_at_or_zero() == other.watched_at_or_zero();
    let resume_at = match (primary.resume_at, other.resume_at) {
        (Some(a), Some(b)) if tie => Some(a.max(b)),
        (Some(a), _) => Some(a),
        (None, b) => b,
    };
    Pointer {
        relay: primary.relay.or(other.relay),
        watched_at: primary.watched_at.or(other.watched_at),
        resume_at,
        completed: primary.completed || other.completed,
        session: primary.session || other.session,
        ..primary
    }
}
