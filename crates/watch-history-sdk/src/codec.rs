//! 载荷编解码模块
//!
//! - 按字节预算构建月份载荷，超出预算的 pointer 被跳过而不是中止整批
//! - 月份内容超过单条记录上限时拆分为多个分片载荷
//! - 宽松解析明文载荷，以及公开 pointer 标签的双向转换
//! - 计算用于变更检测的指纹

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::pointer::{self, normalize_tag, BucketSet, Pointer};

/// 当前载荷格式版本
pub const PAYLOAD_VERSION: u32 = 2;

/// 分片元数据 (`chunkIndex` / `totalChunks`) 预留的字节数
const CHUNK_METADATA_RESERVE: usize = 40;

/// 月份明文载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthPayload {
    pub version: u32,
    pub month: String,
    pub items: Vec<String>,
    #[serde(default)]
    pub watched_at: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resume_at: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relays: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

impl MonthPayload {
    pub fn new(month: &str) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            month: month.to_string(),
            items: Vec::new(),
            watched_at: BTreeMap::new(),
            resume_at: BTreeMap::new(),
            completed: Vec::new(),
            session: Vec::new(),
            relays: BTreeMap::new(),
            chunk_index: None,
            total_chunks: None,
        }
    }

    fn push(&mut self, pointer: &Pointer, watched_at: Option<i64>) {
        let value = pointer.value.clone();
        if let Some(ts) = watched_at {
            self.watched_at.insert(value.clone(), ts);
        }
        if let Some(resume_at) = pointer.resume_at {
            self.resume_at.insert(value.clone(), resume_at);
        }
        if pointer.completed {
            self.completed.push(value.clone());
        }
        if pointer.session {
            self.session.push(value.clone());
        }
        if let Some(relay) = &pointer.relay {
            self.relays.insert(value.clone(), relay.clone());
        }
        self.items.push(value);
    }

    /// 序列化后的字节数
    pub fn byte_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// [`build_payload`] 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBuild {
    pub payload: MonthPayload,
    pub included: Vec<Pointer>,
    pub skipped: Vec<Pointer>,
}

/// 在字节预算内构建单个月份载荷
///
/// 按输入顺序处理：单条就超预算的直接跳过；否则尝试加入，
/// 累计大小超预算则跳过该条并继续处理后续 pointer。
/// `watched_at_overrides` 以 pointer key 为键。
pub fn build_payload(
    month: &str,
    pointers: &[Pointer],
    watched_at_overrides: &HashMap<String, i64>,
    max_bytes: usize,
) -> PayloadBuild {
    let mut payload = MonthPayload::new(month);
    let mut included = Vec::new();
    let mut skipped = Vec::new();

    for pointer in pointers {
        let watched_at = watched_at_overrides
            .get(&pointer.key())
            .copied()
            .or(pointer.watched_at);

        if !fits_alone(month, pointer, watched_at, max_bytes) {
            skipped.push(pointer.clone());
            continue;
        }

        let mut candidate = payload.clone();
        candidate.push(pointer, watched_at);
        if candidate.byte_len() > max_bytes {
            skipped.push(pointer.clone());
            continue;
        }

        payload = candidate;
        let mut accepted = pointer.clone();
        accepted.watched_at = watched_at;
        included.push(accepted);
    }

    PayloadBuild {
        payload,
        included,
        skipped,
    }
}

fn fits_alone(month: &str, pointer: &Pointer, watched_at: Option<i64>, max_bytes: usize) -> bool {
    let mut solo = MonthPayload::new(month);
    solo.push(pointer, watched_at);
    solo.byte_len() <= max_bytes
}

/// 月份分片结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPayloads {
    /// 至少包含一个分片；空月份也有一个空载荷
    pub chunks: Vec<PayloadBuild>,
    /// 单条就超出预算、无法发布的 pointer
    pub skipped: Vec<Pointer>,
}

/// 把一个月份拆成若干分片载荷，只有单条超预算的 pointer 会被丢弃
pub fn split_payloads(month: &str, pointers: &[Pointer], max_bytes: usize) -> SplitPayloads {
    let budget = max_bytes.saturating_sub(CHUNK_METADATA_RESERVE);
    let overrides = HashMap::new();
    let mut remaining: Vec<Pointer> = pointers.to_vec();
    let mut chunks: Vec<PayloadBuild> = Vec::new();
    let mut dropped = Vec::new();

    loop {
        let build = build_payload(month, &remaining, &overrides, budget);
        let (oversize, overflow): (Vec<Pointer>, Vec<Pointer>) = build
            .skipped
            .iter()
            .cloned()
            .partition(|p| !fits_alone(month, p, p.watched_at, budget));
        dropped.extend(oversize);

        if build.included.is_empty() && !chunks.is_empty() {
            break;
        }
        chunks.push(PayloadBuild {
            skipped: Vec::new(),
            ..build
        });
        if overflow.is_empty() {
            break;
        }
        remaining = overflow;
    }

    let total = chunks.len();
    if total > 1 {
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.payload.chunk_index = Some(index);
            chunk.payload.total_chunks = Some(total);
        }
    }

    if !dropped.is_empty() {
        debug!("月份 {} 有 {} 条记录超出单条预算被跳过", month, dropped.len());
    }

    SplitPayloads {
        chunks,
        skipped: dropped,
    }
}

/// 解析后的载荷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPayload {
    pub version: u32,
    pub month: Option<String>,
    pub items: Vec<Pointer>,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// 内容是否像 JSON 结构（以 `{` 或 `[` 开头）
pub fn looks_like_json(content: &str) -> bool {
    matches!(content.trim_start().chars().next(), Some('{') | Some('['))
}

/// 宽松解析明文载荷，非 JSON 返回 None
///
/// `items` 既可以是裸值字符串，也可以是 pointer 对象或标签数组。
pub fn parse_payload(plaintext: &str) -> Option<ParsedPayload> {
    if !looks_like_json(plaintext) {
        return None;
    }
    let value: Value = serde_json::from_str(plaintext).ok()?;
    let map = value.as_object()?;

    let watched_at = int_map(map.get("watchedAt"));
    let resume_at = int_map(map.get("resumeAt"));
    let completed = string_set(map.get("completed"));
    let session = string_set(map.get("session"));
    let relays: HashMap<String, String> = map
        .get("relays")
        .and_then(Value::as_object)
        .map(|relays| {
            relays
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|r| (k.clone(), r.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for raw in map.get("items").and_then(Value::as_array).into_iter().flatten() {
        let Some(mut pointer) = pointer::normalize(raw.clone()) else {
            continue;
        };
        if !seen.insert(pointer.key()) {
            continue;
        }
        let value = pointer.value.clone();
        if let Some(ts) = watched_at.get(&value) {
            pointer.watched_at = Some((*ts).max(0));
        }
        if let Some(resume) = resume_at.get(&value) {
            pointer.resume_at = Some((*resume).max(0));
        }
        if completed.contains(&value) {
            pointer.completed = true;
        }
        if session.contains(&value) {
            pointer.session = true;
        }
        if pointer.relay.is_none() {
            pointer.relay = relays.get(&value).cloned();
        }
        items.push(pointer);
    }

    Some(ParsedPayload {
        version: map
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0),
        month: map.get("month").and_then(Value::as_str).map(String::from),
        items,
        chunk_index: map.get("chunkIndex").and_then(Value::as_u64).unwrap_or(0) as usize,
        total_chunks: map
            .get("totalChunks")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize,
    })
}

fn int_map(value: Option<&Value>) -> HashMap<String, i64> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    v.as_i64()
                        .or_else(|| v.as_f64().map(|f| f.floor() as i64))
                        .map(|ts| (k.clone(), ts))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn string_set(value: Option<&Value>) -> HashSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// 公开 pointer 标签
pub fn pointer_tags(pointers: &[Pointer]) -> Vec<Vec<String>> {
    pointers.iter().map(Pointer::to_tag).collect()
}

/// 从记录标签恢复 pointer（去重，忽略非 pointer 标签）
pub fn pointers_from_tags(tags: &[Vec<String>]) -> Vec<Pointer> {
    let mut seen = HashSet::new();
    tags.iter()
        .filter_map(|tag| normalize_tag(tag.as_slice()))
        .filter(|pointer| seen.insert(pointer.key()))
        .collect()
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    watched_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_at: Option<i64>,
    completed: bool,
}

/// 计算列表指纹
///
/// 按 (key 升序, 观看时间降序) 稳定排序后序列化并做 SHA-256，
/// 与输入顺序无关。`session` 只是来源标记，不参与指纹。
pub fn fingerprint(items: &[Pointer]) -> String {
    let mut sorted: Vec<&Pointer> = items.iter().collect();
    sorted.sort_by(|a, b| {
        a.key()
            .cmp(&b.key())
            .then_with(|| b.watched_at_or_zero().cmp(&a.watched_at_or_zero()))
    });
    let entries: Vec<FingerprintEntry<'_>> = sorted
        .into_iter()
        .map(|p| FingerprintEntry {
            key: p.key(),
            relay: p.relay.as_deref(),
            watched_at: p.watched_at,
            resume_at: p.resume_at,
            completed: p.completed,
        })
        .collect();
    let serialized = serde_json::to_vec(&entries).unwrap_or_default();
    hex::encode(Sha256::digest(&serialized))
}

/// 计算分桶集合的指纹，与 [`fingerprint`] 对同一语义集合结果一致
pub fn fingerprint_buckets(buckets: &BucketSet) -> String {
    fingerprint(&buckets.items())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::canonicalize;

    fn pointers(count: usize) -> Vec<Pointer> {
        (0..count)
            .map(|i| Pointer::event(format!("{:064x}", i)).with_watched_at(1_705_000_000 + i as i64))
            .collect()
    }

    #[test]
    fn test_oversize_pointer_is_skipped() {
        let huge = Pointer::event("x".repeat(400)).with_watched_at(1_705_000_000);
        let build = build_payload("2024-01", &[huge.clone()], &HashMap::new(), 256);
        assert!(build.included.is_empty());
        assert_eq!(build.skipped, vec![huge]);
        assert!(build.payload.items.is_empty());
    }

    #[test]
    fn test_budget_overflow_continues_with_next_pointer() {
        let medium = Pointer::event("m".repeat(50)).with_watched_at(1);
        let medium_two = Pointer::event("n".repeat(50)).with_watched_at(2);
        let small = Pointer::event("s").with_watched_at(3);
        let input = vec![medium.clone(), medium_two.clone(), small.clone()];
        let build = build_payload("2024-01", &input, &HashMap::new(), 256);

        let included: Vec<&str> = build.included.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(included, vec![medium.value.as_str(), "s"]);
        assert_eq!(build.skipped, vec![medium_two]);
        assert!(build.payload.byte_len() <= 256);

        // 决策可复现
        assert_eq!(build_payload("2024-01", &input, &HashMap::new(), 256), build);
    }

    #[test]
    fn test_watched_at_override() {
        let pointer = Pointer::event("v1").with_watched_at(100);
        let mut overrides = HashMap::new();
        overrides.insert(pointer.key(), 900);
        let build = build_payload("1970-01", &[pointer], &overrides, 1024);
        assert_eq!(build.payload.watched_at.get("v1"), Some(&900));
        assert_eq!(build.included[0].watched_at, Some(900));
    }

    #[test]
    fn test_payload_shape() {
        let pointer = Pointer::event("v1")
            .with_watched_at(100)
            .with_resume_at(42)
            .with_session(true);
        let build = build_payload("1970-01", &[pointer], &HashMap::new(), 1024);
        let value: Value = serde_json::from_str(&build.payload.to_json().unwrap()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["items"][0], "v1");
        assert_eq!(value["watchedAt"]["v1"], 100);
        assert_eq!(value["resumeAt"]["v1"], 42);
        assert_eq!(value["session"][0], "v1");
        assert!(value.get("completed").is_none());
        assert!(value.get("chunkIndex").is_none());
    }

    #[test]
    fn test_split_payloads_keeps_everything_that_fits() {
        let input = pointers(40);
        let split = split_payloads("2024-01", &input, 1024);
        assert!(split.chunks.len() > 1);
        assert!(split.skipped.is_empty());

        let total: usize = split.chunks.iter().map(|c| c.included.len()).sum();
        assert_eq!(total, 40);
        for (index, chunk) in split.chunks.iter().enumerate() {
            assert!(chunk.payload.byte_len() <= 1024);
            assert_eq!(chunk.payload.chunk_index, Some(index));
            assert_eq!(chunk.payload.total_chunks, Some(split.chunks.len()));
        }
    }

    #[test]
    fn test_split_payloads_empty_month() {
        let split = split_payloads("2024-01", &[], 1024);
        assert_eq!(split.chunks.len(), 1);
        assert!(split.chunks[0].payload.items.is_empty());
        assert_eq!(split.chunks[0].payload.total_chunks, None);
    }

    #[test]
    fn test_parse_payload() {
        let input = vec![
            Pointer::event("v1").with_watched_at(100).with_completed(true),
            Pointer::address("30078:pk:x").with_watched_at(90).with_relay("wss://r"),
        ];
        let build = build_payload("1970-01", &input, &HashMap::new(), 4096);
        let parsed = parse_payload(&build.payload.to_json().unwrap()).unwrap();
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.month.as_deref(), Some("1970-01"));
        assert_eq!(parsed.items, input);
        assert_eq!(parsed.total_chunks, 1);
    }

    #[test]
    fn test_parse_payload_lenient() {
        assert!(parse_payload("not json").is_none());
        assert!(parse_payload("{broken").is_none());

        let parsed = parse_payload(
            r#"{"items":[{"type":"e","value":"a1","watchedAt":5},["e","a2"],"a1",7],"watchedAt":{"a2":"bad"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.version, 0);
        let values: Vec<&str> = parsed.items.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(values, vec!["a1", "a2"]);
        assert_eq!(parsed.items[0].watched_at, Some(5));
        assert_eq!(parsed.items[1].watched_at, None);
    }

    #[test]
    fn test_pointer_tags() {
        let tags = vec![
            vec!["d".to_string(), "2024-01".to_string()],
            vec!["e".to_string(), "v1".to_string(), "wss://r".to_string()],
            vec!["e".to_string(), "V1".to_string()],
            vec!["a".to_string(), "30078:pk:x".to_string()],
        ];
        let pointers = pointers_from_tags(&tags);
        assert_eq!(pointers.len(), 2);
        assert_eq!(pointer_tags(&pointers), vec![tags[1].clone(), tags[3].clone()]);
    }

    #[test]
    fn test_fingerprint_stable_across_orderings() {
        let items = pointers(6);
        let mut reversed = items.clone();
        reversed.reverse();
        assert_eq!(fingerprint(&items), fingerprint(&reversed));

        let buckets_a = canonicalize(items.clone(), 0);
        let buckets_b: BucketSet = buckets_a
            .iter()
            .rev()
            .map(|(month, list)| (month.clone(), list.iter().rev().cloned().collect()))
            .collect();
        assert_eq!(fingerprint_buckets(&buckets_a), fingerprint_buckets(&buckets_b));
        assert_eq!(fingerprint_buckets(&buckets_a), fingerprint(&items));
        assert_eq!(fingerprint(&items).len(), 64);
    }

    #[test]
    fn test_fingerprint_detects_changes() {
        let items = pointers(3);
        let base = fingerprint(&items);

        let mut changed = items.clone();
        changed[0].watched_at = Some(1);
        assert_ne!(fingerprint(&changed), base);

        let mut session_only = items.clone();
        session_only[1].session = true;
        assert_eq!(fingerprint(&session_only), base);

        assert_ne!(fingerprint(&items[..2]), base);
    }
}
