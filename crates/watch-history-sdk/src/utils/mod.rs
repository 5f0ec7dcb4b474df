//! 工具模块

pub mod time;

pub use time::{month_key, normalize_timestamp_secs, now_millis, now_secs, MonotonicClock};
