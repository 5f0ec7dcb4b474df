//! 加密方案协商
//!
//! 加密按优先级尝试 `nip44_v2` → `nip04`，成功的方案写入 `["encrypted", scheme]` 提示标签。
//! 解密优先使用提示标签；没有提示时用密文结构猜测旧格式，再按固定顺序回退。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::looks_like_json;
use crate::error::{Result, WatchHistoryError};
use crate::identity::SigningContext;
use crate::network::{Record, UnsignedRecord};

/// 加密方案
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionScheme {
    #[serde(rename = "nip44_v2")]
    Nip44V2,
    #[serde(rename = "nip44")]
    Nip44,
    #[serde(rename = "nip04")]
    Nip04,
}

impl EncryptionScheme {
    /// 写入提示标签的名称
    pub fn as_tag(&self) -> &'static str {
        match self {
            EncryptionScheme::Nip44V2 => "nip44_v2",
            EncryptionScheme::Nip44 => "nip44",
            EncryptionScheme::Nip04 => "nip04",
        }
    }

    /// 解析提示标签，兼容常见拼写
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "nip44_v2" | "nip44-v2" | "nip44v2" => Some(EncryptionScheme::Nip44V2),
            "nip44" | "nip-44" => Some(EncryptionScheme::Nip44),
            "nip04" | "nip-04" => Some(EncryptionScheme::Nip04),
            _ => None,
        }
    }
}

/// 加密优先级
pub const ENCRYPT_PRIORITY: [EncryptionScheme; 2] =
    [EncryptionScheme::Nip44V2, EncryptionScheme::Nip04];

/// 解密回退顺序
pub const DECRYPT_FALLBACK: [EncryptionScheme; 3] = [
    EncryptionScheme::Nip44V2,
    EncryptionScheme::Nip44,
    EncryptionScheme::Nip04,
];

/// 交互式签名器（例如浏览器扩展），只能代表当前登录身份
#[async_trait]
pub trait ActiveSigner: Send + Sync {
    async fn sign_record(&self, record: UnsignedRecord) -> Result<Record>;

    fn supports(&self, scheme: EncryptionScheme) -> bool;

    async fn encrypt(&self, scheme: EncryptionScheme, peer: &str, plaintext: &str) -> Result<String>;

    async fn decrypt(&self, scheme: EncryptionScheme, peer: &str, ciphertext: &str) -> Result<String>;
}

/// 使用原始私钥的密码学工具
#[async_trait]
pub trait KeyToolkit: Send + Sync {
    fn supports(&self, scheme: EncryptionScheme) -> bool;

    async fn encrypt(
        &self,
        scheme: EncryptionScheme,
        private_key: &str,
        peer: &str,
        plaintext: &str,
    ) -> Result<String>;

    async fn decrypt(
        &self,
        scheme: EncryptionScheme,
        private_key: &str,
        peer: &str,
        ciphertext: &str,
    ) -> Result<String>;

    async fn sign_with_key(&self, record: UnsignedRecord, private_key: &str) -> Result<Record>;
}

fn legacy_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}\?iv=[A-Za-z0-9+/]+={0,2}$").ok())
        .as_ref()
}

/// 判断密文是否为旧格式 `base64?iv=base64`
pub fn looks_like_legacy_ciphertext(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() || looks_like_json(trimmed) {
        return false;
    }
    legacy_pattern()
        .map(|pattern| pattern.is_match(trimmed))
        .unwrap_or(false)
}

/// 解密尝试顺序：提示标签 > 结构猜测 > 固定回退顺序
pub fn decrypt_order(hint: Option<&str>, ciphertext: &str) -> Vec<EncryptionScheme> {
    let mut order = Vec::with_capacity(DECRYPT_FALLBACK.len());
    if let Some(scheme) = hint.and_then(EncryptionScheme::from_tag) {
        order.push(scheme);
    } else if looks_like_legacy_ciphertext(ciphertext) {
        order.push(EncryptionScheme::Nip04);
    }
    for scheme in DECRYPT_FALLBACK {
        if !order.contains(&scheme) {
            order.push(scheme);
        }
    }
    order
}

/// 加密/解密/签名的能力协商器
#[derive(Clone, Default)]
pub struct EncryptionNegotiator {
    toolkit: Option<Arc<dyn KeyToolkit>>,
}

impl std::fmt::Debug for EncryptionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionNegotiator")
            .field("toolkit", &self.toolkit.is_some())
            .finish()
    }
}

impl EncryptionNegotiator {
    pub fn new(toolkit: Option<Arc<dyn KeyToolkit>>) -> Self {
        Self { toolkit }
    }

    fn supports(&self, ctx: &SigningContext, scheme: EncryptionScheme) -> bool {
        match ctx {
            SigningContext::Extension(signer) => signer.supports(scheme),
            SigningContext::SessionKey { .. } => self
                .toolkit
                .as_ref()
                .map(|toolkit| toolkit.supports(scheme))
                .unwrap_or(false),
        }
    }

    async fn encrypt_with(
        &self,
        ctx: &SigningContext,
        scheme: EncryptionScheme,
        peer: &str,
        plaintext: &str,
    ) -> Result<String> {
        match ctx {
            SigningContext::Extension(signer) => signer.encrypt(scheme, peer, plaintext).await,
            SigningContext::SessionKey { private_key } => match &self.toolkit {
                Some(toolkit) => toolkit.encrypt(scheme, private_key, peer, plaintext).await,
                None => Err(WatchHistoryError::EncryptionFailed("缺少密钥工具".to_string())),
            },
        }
    }

    async fn decrypt_with(
        &self,
        ctx: &SigningContext,
        scheme: EncryptionScheme,
        peer: &str,
        ciphertext: &str,
    ) -> Result<String> {
        match ctx {
            SigningContext::Extension(signer) => signer.decrypt(scheme, peer, ciphertext).await,
            SigningContext::SessionKey { private_key } => match &self.toolkit {
                Some(toolkit) => toolkit.decrypt(scheme, private_key, peer, ciphertext).await,
                None => Err(WatchHistoryError::DecryptionFailed("缺少密钥工具".to_string())),
            },
        }
    }

    /// 按优先级加密，返回密文和实际使用的方案
    pub async fn encrypt(
        &self,
        ctx: &SigningContext,
        peer: &str,
        plaintext: &str,
    ) -> Result<(String, EncryptionScheme)> {
        let mut failures = Vec::new();
        for scheme in ENCRYPT_PRIORITY {
            if !self.supports(ctx, scheme) {
                continue;
            }
            match self.encrypt_with(ctx, scheme, peer, plaintext).await {
                Ok(ciphertext) => {
                    debug!("观看历史载荷使用 {} 加密", scheme.as_tag());
                    return Ok((ciphertext, scheme));
                }
                Err(e) => {
                    warn!("使用 {} 加密失败: {}", scheme.as_tag(), e);
                    failures.push(format!("{}: {}", scheme.as_tag(), e));
                }
            }
        }
        let reason = if failures.is_empty() {
            "没有可用的加密方案".to_string()
        } else {
            failures.join("; ")
        };
        Err(WatchHistoryError::EncryptionFailed(reason))
    }

    /// 解密，`hint` 为记录上的 `encrypted` 标签值
    pub async fn decrypt(
        &self,
        ctx: &SigningContext,
        peer: &str,
        ciphertext: &str,
        hint: Option<&str>,
    ) -> Result<(String, EncryptionScheme)> {
        let mut failures = Vec::new();
        for scheme in decrypt_order(hint, ciphertext) {
            if !self.supports(ctx, scheme) {
                continue;
            }
            match self.decrypt_with(ctx, scheme, peer, ciphertext).await {
                Ok(plaintext) => return Ok((plaintext, scheme)),
                Err(e) => {
                    debug!("使用 {} 解密失败: {}", scheme.as_tag(), e);
                    failures.push(format!("{}: {}", scheme.as_tag(), e));
                }
            }
        }
        let reason = if failures.is_empty() {
            "没有可用的解密方案".to_string()
        } else {
            failures.join("; ")
        };
        Err(WatchHistoryError::DecryptionFailed(reason))
    }

    /// 按签名上下文签名记录
    pub async fn sign(&self, ctx: &SigningContext, record: UnsignedRecord) -> Result<Record> {
        let signed = match ctx {
            SigningContext::Extension(signer) => signer.sign_record(record).await,
            SigningContext::SessionKey { private_key } => match &self.toolkit {
                Some(toolkit) => toolkit.sign_with_key(record, private_key).await,
                None => return Err(WatchHistoryError::SigningFailed("缺少密钥工具".to_string())),
            },
        };
        signed.map_err(|e| match e {
            WatchHistoryError::SigningFailed(_) => e,
            other => WatchHistoryError::SigningFailed(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_helpers::{MockSigner, MockToolkit};

    fn session_ctx() -> SigningContext {
        SigningContext::SessionKey {
            private_key: "sk".to_string(),
        }
    }

    #[test]
    fn test_scheme_tags() {
        assert_eq!(EncryptionScheme::from_tag("NIP-04"), Some(EncryptionScheme::Nip04));
        assert_eq!(EncryptionScheme::from_tag("nip44_v2"), Some(EncryptionScheme::Nip44V2));
        assert_eq!(EncryptionScheme::from_tag("rot13"), None);
        assert_eq!(EncryptionScheme::Nip44V2.as_tag(), "nip44_v2");
    }

    #[test]
    fn test_legacy_heuristic() {
        assert!(looks_like_legacy_ciphertext("YWJjZA==?iv=MTIzNDU2"));
        assert!(!looks_like_legacy_ciphertext("{\"items\":[]}"));
        assert!(!looks_like_legacy_ciphertext("AgBCDEF"));
        assert!(!looks_like_legacy_ciphertext(""));
    }

    #[test]
    fn test_decrypt_order() {
        use EncryptionScheme::*;
        assert_eq!(decrypt_order(Some("nip04"), "x"), vec![Nip04, Nip44V2, Nip44]);
        assert_eq!(decrypt_order(None, "YWJj?iv=MTIz"), vec![Nip04, Nip44V2, Nip44]);
        assert_eq!(decrypt_order(None, "opaque"), vec![Nip44V2, Nip44, Nip04]);
        assert_eq!(decrypt_order(Some("unknown"), "opaque"), vec![Nip44V2, Nip44, Nip04]);
    }

    #[tokio::test]
    async fn test_encrypt_prefers_nip44_v2() {
        let negotiator = EncryptionNegotiator::new(Some(Arc::new(MockToolkit::new())));
        let (ciphertext, scheme) = negotiator.encrypt(&session_ctx(), "peer", "hello").await.unwrap();
        assert_eq!(scheme, EncryptionScheme::Nip44V2);

        let (plaintext, used) = negotiator
            .decrypt(&session_ctx(), "peer", &ciphertext, Some(scheme.as_tag()))
            .await
            .unwrap();
        assert_eq!(plaintext, "hello");
        assert_eq!(used, EncryptionScheme::Nip44V2);
    }

    #[tokio::test]
    async fn test_encrypt_falls_back_to_nip04() {
        let toolkit = MockToolkit::with_schemes(&[EncryptionScheme::Nip04]);
        let negotiator = EncryptionNegotiator::new(Some(Arc::new(toolkit)));
        let (ciphertext, scheme) = negotiator.encrypt(&session_ctx(), "peer", "hello").await.unwrap();
        assert_eq!(scheme, EncryptionScheme::Nip04);
        assert!(looks_like_legacy_ciphertext(&ciphertext));

        // 无提示时通过结构猜测解密
        let (plaintext, used) = negotiator
            .decrypt(&session_ctx(), "peer", &ciphertext, None)
            .await
            .unwrap();
        assert_eq!(plaintext, "hello");
        assert_eq!(used, EncryptionScheme::Nip04);
    }

    #[tokio::test]
    async fn test_encrypt_without_capability_is_retryable_failure() {
        let negotiator = EncryptionNegotiator::new(None);
        let err = negotiator.encrypt(&session_ctx(), "peer", "hello").await.unwrap_err();
        assert_eq!(err.code(), "encryption-failed");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_decrypt_all_fail() {
        let negotiator = EncryptionNegotiator::new(Some(Arc::new(MockToolkit::new())));
        let err = negotiator
            .decrypt(&session_ctx(), "peer", "garbage", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "decryption-failed");
    }

    #[tokio::test]
    async fn test_extension_signer_path() {
        let signer = Arc::new(MockSigner::new("alice"));
        let ctx = SigningContext::Extension(signer.clone());
        let negotiator = EncryptionNegotiator::new(None);

        let (ciphertext, scheme) = negotiator.encrypt(&ctx, "alice", "payload").await.unwrap();
        assert_eq!(scheme, EncryptionScheme::Nip44V2);
        let (plaintext, _) = negotiator.decrypt(&ctx, "alice", &ciphertext, None).await.unwrap();
        assert_eq!(plaintext, "payload");

        let unsigned = UnsignedRecord {
            pubkey: "alice".into(),
            created_at: 1,
            kind: 30079,
            tags: vec![],
            content: ciphertext,
        };
        let record = negotiator.sign(&ctx, unsigned).await.unwrap();
        assert_eq!(record.pubkey, "alice");
        assert!(!record.sig.is_empty());
    }

    #[tokio::test]
    async fn test_session_sign_without_toolkit() {
        let negotiator = EncryptionNegotiator::new(None);
        let unsigned = UnsignedRecord {
            pubkey: "bob".into(),
            created_at: 1,
            kind: 30079,
            tags: vec![],
            content: String::new(),
        };
        let err = negotiator.sign(&session_ctx(), unsigned).await.unwrap_err();
        assert_eq!(err.code(), "signing-failed");
        assert!(!err.is_retryable());
    }
}
