use thiserror::Error;

/// 观看历史同步错误
///
/// 每个变体都有稳定的字符串错误码（见 [`WatchHistoryError::code`]），
/// 调用方可据此区分“本地校验失败”和“网络/签名失败”。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchHistoryError {
    #[error("无法确定操作身份 (actor)")]
    MissingActor,
    #[error("无效的 pointer: {0}")]
    InvalidPointer(String),
    #[error("relay 传输层未初始化")]
    TransportUninitialized,
    #[error("会话身份不匹配: 期望 {expected}, 实际 {actual}")]
    SessionActorMismatch { expected: String, actual: String },
    #[error("会话身份缺失")]
    SessionActorMissing,
    #[error("缺少会话私钥")]
    MissingSessionKey,
    #[error("加密失败: {0}")]
    EncryptionFailed(String),
    #[error("解密失败: {0}")]
    DecryptionFailed(String),
    #[error("签名失败: {0}")]
    SigningFailed(String),
    #[error("所有 relay 均拒绝发布")]
    PublishRejected,
    #[error("仅部分 relay 接受发布: {accepted}/{total}")]
    PartialRelayAcceptance { accepted: usize, total: usize },
    #[error("重发任务 {task_id} 已达到最大尝试次数 {attempts}")]
    RepublishExhausted { task_id: String, attempts: u32 },
    #[error("传输错误: {0}")]
    Transport(String),
    #[error("KV 存储错误: {0}")]
    KvStore(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("IO 错误: {0}")]
    IO(String),
    #[error("配置错误: {0}")]
    Config(String),
}

impl WatchHistoryError {
    /// 稳定的错误码，用于日志、事件和聚合结果
    pub fn code(&self) -> &'static str {
        match self {
            WatchHistoryError::MissingActor => "missing-actor",
            WatchHistoryError::InvalidPointer(_) => "invalid-pointer",
            WatchHistoryError::TransportUninitialized => "transport-uninitialized",
            WatchHistoryError::SessionActorMismatch { .. } => "session-actor-mismatch",
            WatchHistoryError::SessionActorMissing => "session-actor-missing",
            WatchHistoryError::MissingSessionKey => "missing-session-key",
            WatchHistoryError::EncryptionFailed(_) => "encryption-failed",
            WatchHistoryError::DecryptionFailed(_) => "decryption-failed",
            WatchHistoryError::SigningFailed(_) => "signing-failed",
            WatchHistoryError::PublishRejected => "publish-rejected",
            WatchHistoryError::PartialRelayAcceptance { .. } => "partial-relay-acceptance",
            WatchHistoryError::RepublishExhausted { .. } => "republish-exhausted",
            WatchHistoryError::Transport(_) => "transport",
            WatchHistoryError::KvStore(_) => "kv-store",
            WatchHistoryError::Serialization(_) => "serialization",
            WatchHistoryError::IO(_) => "io",
            WatchHistoryError::Config(_) => "config",
        }
    }

    /// 判断是否可以交给重发调度器自动重试
    ///
    /// 本地校验错误和身份/签名错误需要用户介入，永远不自动重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatchHistoryError::EncryptionFailed(_)
                | WatchHistoryError::PublishRejected
                | WatchHistoryError::PartialRelayAcceptance { .. }
                | WatchHistoryError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for WatchHistoryError {
    fn from(error: serde_json::Error) -> Self {
        WatchHistoryError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for WatchHistoryError {
    fn from(error: std::io::Error) -> Self {
        WatchHistoryError::IO(error.to_string())
    }
}

impl From<sled::Error> for WatchHistoryError {
    fn from(error: sled::Error) -> Self {
        WatchHistoryError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WatchHistoryError>;
