//! 时间处理工具模块
//!
//! - 观看时间 (`watched_at`) 统一使用 UTC 秒级时间戳
//! - 缓存保存时间 (`saved_at`) 统一使用 UTC 毫秒时间戳
//! - 月份分桶使用 UTC 的 `YYYY-MM`

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

/// 超过该值的时间戳视为毫秒
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// 纪元月份，缺失或为 0 的观看时间都落在这里
pub const EPOCH_MONTH: &str = "1970-01";

/// 获取当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 获取当前 UTC 秒级时间戳
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// 将秒级时间戳映射为 UTC 月份键 `YYYY-MM`
pub fn month_key(watched_at: i64) -> String {
    if watched_at <= 0 {
        return EPOCH_MONTH.to_string();
    }
    match Utc.timestamp_opt(watched_at, 0).single() {
        Some(dt) => dt.format("%Y-%m").to_string(),
        None => EPOCH_MONTH.to_string(),
    }
}

/// 统一为秒级时间戳（毫秒值自动换算），非正数返回 None
pub fn normalize_timestamp_secs(value: i64) -> Option<i64> {
    if value <= 0 {
        return None;
    }
    if value > MILLIS_THRESHOLD {
        return Some(value / 1000);
    }
    Some(value)
}

/// 进程内单调递增的 `created_at` 时钟
///
/// relay 只有秒级精度，连续发布必须保证 `created_at` 严格递增。
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<i64>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 `max(now, last + 1)` 并记录
    pub fn next(&self) -> i64 {
        self.next_after(now_secs())
    }

    pub(crate) fn next_after(&self, now: i64) -> i64 {
        let mut last = self.last.lock();
        let value = now.max(*last + 1);
        *last = value;
        value
    }

    /// 最近一次发放的时间戳
    pub fn last(&self) -> i64 {
        *self.last.lock()
    }
}
