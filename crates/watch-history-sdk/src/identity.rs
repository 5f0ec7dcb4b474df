//! 身份解析
//!
//! 决定一次操作代表哪个 actor（显式指定 > 当前登录身份 > 临时会话身份），
//! 以及可以使用哪种签名能力：交互式签名器只能代表当前登录身份，
//! 其他 actor 一律使用本地持有的会话私钥。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::crypto::ActiveSigner;
use crate::error::{Result, WatchHistoryError};
use crate::network::{DecodedIdentifier, IdentifierDecoder};

/// 临时会话身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionActor {
    pub pubkey: String,
    pub private_key: Option<String>,
}

/// 登录状态与会话身份提供者（由宿主应用实现）
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// 当前登录身份的公钥
    fn logged_pubkey(&self) -> Option<String>;

    /// 当前临时会话身份
    fn session_actor(&self) -> Option<SessionActor>;

    /// 确保存在临时会话身份，返回其公钥
    async fn ensure_session_actor(&self) -> Result<Option<String>>;
}

/// 签名上下文
#[derive(Clone)]
pub enum SigningContext {
    /// 当前登录身份的交互式签名器
    Extension(Arc<dyn ActiveSigner>),
    /// 临时会话私钥
    SessionKey { private_key: String },
}

impl SigningContext {
    /// 以会话身份发布的 pointer 需要标记 `session = true`
    pub fn is_session(&self) -> bool {
        matches!(self, SigningContext::SessionKey { .. })
    }
}

impl std::fmt::Debug for SigningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningContext::Extension(_) => f.write_str("SigningContext::Extension"),
            SigningContext::SessionKey { .. } => f.write_str("SigningContext::SessionKey"),
        }
    }
}

/// 规范化 actor key：64 位十六进制转小写，`npub` 经解码器解码，其余去空白后小写
pub fn normalize_actor_key(actor: &str, decoder: Option<&dyn IdentifierDecoder>) -> Option<String> {
    let trimmed = actor.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_hex_key(trimmed) {
        return Some(trimmed.to_lowercase());
    }
    if trimmed.starts_with("npub") {
        if let Some(DecodedIdentifier::Pubkey(pubkey)) = decoder.and_then(|d| d.decode(trimmed)) {
            let pubkey = pubkey.trim().to_lowercase();
            if !pubkey.is_empty() {
                return Some(pubkey);
            }
        }
    }
    Some(trimmed.to_lowercase())
}

/// 是否为 64 位十六进制公钥
pub fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

type ActorSource<'a> = Box<dyn Fn() -> Option<String> + 'a>;

/// 身份解析器
#[derive(Clone, Default)]
pub struct IdentityResolver {
    session: Option<Arc<dyn SessionProvider>>,
    signer: Option<Arc<dyn ActiveSigner>>,
    decoder: Option<Arc<dyn IdentifierDecoder>>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("session", &self.session.is_some())
            .field("signer", &self.signer.is_some())
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(capabilities: &Capabilities) -> Self {
        Self {
            session: capabilities.session.clone(),
            signer: capabilities.signer.clone(),
            decoder: capabilities.decoder.clone(),
        }
    }

    /// 规范化 actor key
    pub fn normalize(&self, actor: &str) -> Option<String> {
        normalize_actor_key(actor, self.decoder.as_deref())
    }

    pub fn decoder(&self) -> Option<&Arc<dyn IdentifierDecoder>> {
        self.decoder.as_ref()
    }

    /// 当前登录身份（已规范化）
    pub fn logged_actor(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(|s| s.logged_pubkey())
            .and_then(|pubkey| self.normalize(&pubkey))
    }

    fn session_actor(&self) -> Option<SessionActor> {
        self.session.as_ref().and_then(|s| s.session_actor())
    }

    /// 按优先级解析 actor：显式 > 登录 > 会话
    pub fn resolve(&self, explicit: Option<&str>) -> Result<String> {
        let sources: [ActorSource<'_>; 3] = [
            Box::new(move || explicit.map(String::from)),
            Box::new(|| self.session.as_ref().and_then(|s| s.logged_pubkey())),
            Box::new(|| self.session_actor().map(|actor| actor.pubkey)),
        ];
        sources
            .iter()
            .find_map(|source| source().and_then(|candidate| self.normalize(&candidate)))
            .ok_or(WatchHistoryError::MissingActor)
    }

    /// 同 [`resolve`](Self::resolve)，都没有时请求创建临时会话身份（写路径使用）
    pub async fn resolve_or_ensure(&self, explicit: Option<&str>) -> Result<String> {
        match self.resolve(explicit) {
            Ok(actor) => Ok(actor),
            Err(WatchHistoryError::MissingActor) => {
                let Some(session) = &self.session else {
                    return Err(WatchHistoryError::MissingActor);
                };
                let ensured = session.ensure_session_actor().await?;
                let actor = ensured
                    .as_deref()
                    .and_then(|pubkey| self.normalize(pubkey))
                    .ok_or(WatchHistoryError::MissingActor)?;
                info!("🔑 已创建临时会话身份: {}", actor);
                Ok(actor)
            }
            Err(e) => Err(e),
        }
    }

    /// 为 actor 选择签名上下文
    pub async fn signing_context(&self, actor: &str) -> Result<SigningContext> {
        if self.logged_actor().as_deref() == Some(actor) {
            if let Some(signer) = &self.signer {
                debug!("使用登录身份的交互式签名器: {}", actor);
                return Ok(SigningContext::Extension(signer.clone()));
            }
        }

        let Some(session) = &self.session else {
            return Err(WatchHistoryError::SessionActorMissing);
        };

        let current = self
            .session_actor()
            .and_then(|s| self.normalize(&s.pubkey));
        if current.as_deref() != Some(actor) {
            let ensured = session.ensure_session_actor().await?;
            let ensured_key = ensured.as_deref().and_then(|pubkey| self.normalize(pubkey));
            if ensured_key.as_deref() != Some(actor) {
                warn!(
                    "会话身份与目标 actor 不一致: 期望 {}, 实际 {:?}",
                    actor, ensured_key
                );
                return Err(WatchHistoryError::SessionActorMismatch {
                    expected: actor.to_string(),
                    actual: ensured_key.unwrap_or_default(),
                });
            }
        }

        let refreshed = self
            .session_actor()
            .filter(|s| self.normalize(&s.pubkey).as_deref() == Some(actor))
            .ok_or(WatchHistoryError::SessionActorMissing)?;
        let private_key = refreshed
            .private_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(WatchHistoryError::MissingSessionKey)?;

        Ok(SigningContext::SessionKey { private_key })
    }

    /// 只读路径使用的解密上下文，不会请求创建会话身份
    pub fn decryption_context(&self, actor: &str) -> Option<SigningContext> {
        if self.logged_actor().as_deref() == Some(actor) {
            if let Some(signer) = &self.signer {
                return Some(SigningContext::Extension(signer.clone()));
            }
        }
        self.session_actor()
            .filter(|s| self.normalize(&s.pubkey).as_deref() == Some(actor))
            .and_then(|s| s.private_key)
            .filter(|key| !key.trim().is_empty())
            .map(|private_key| SigningContext::SessionKey { private_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_helpers::{MockDecoder, MockSession, MockSigner};

    const ALICE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn resolver(session: MockSession, with_signer: bool) -> IdentityResolver {
        let mut caps = Capabilities::new()
            .with_session(Arc::new(session))
            .with_decoder(Arc::new(MockDecoder));
        if with_signer {
            caps = caps.with_signer(Arc::new(MockSigner::new(ALICE)));
        }
        IdentityResolver::new(&caps)
    }

    #[test]
    fn test_normalize_actor_key() {
        let upper = ALICE.to_uppercase();
        assert_eq!(normalize_actor_key(&upper, None).as_deref(), Some(ALICE));
        assert_eq!(normalize_actor_key("  ", None), None);
        assert_eq!(
            normalize_actor_key(&format!("npub1{}", BOB), Some(&MockDecoder)).as_deref(),
            Some(BOB)
        );
        assert_eq!(normalize_actor_key(" Someone ", None).as_deref(), Some("someone"));
    }

    #[test]
    fn test_resolve_priority() {
        let r = resolver(MockSession::new(Some(ALICE), Some((BOB, "bob-sk"))), false);
        assert_eq!(r.resolve(Some(BOB)).unwrap(), BOB);
        assert_eq!(r.resolve(None).unwrap(), ALICE);

        let r = resolver(MockSession::new(None, Some((BOB, "bob-sk"))), false);
        assert_eq!(r.resolve(None).unwrap(), BOB);

        let r = resolver(MockSession::new(None, None), false);
        assert_eq!(r.resolve(None).unwrap_err(), WatchHistoryError::MissingActor);
        assert_eq!(r.resolve(Some("   ")).unwrap_err(), WatchHistoryError::MissingActor);
    }

    #[tokio::test]
    async fn test_resolve_or_ensure_creates_session() {
        let session = MockSession::new(None, None).ensuring(BOB, "bob-sk");
        let r = resolver(session, false);
        assert_eq!(r.resolve_or_ensure(None).await.unwrap(), BOB);
    }

    #[tokio::test]
    async fn test_logged_actor_uses_extension() {
        let r = resolver(MockSession::new(Some(ALICE), None), true);
        let ctx = r.signing_context(ALICE).await.unwrap();
        assert!(!ctx.is_session());
    }

    #[tokio::test]
    async fn test_other_actor_uses_session_key() {
        let r = resolver(MockSession::new(Some(ALICE), Some((BOB, "bob-sk"))), true);
        let ctx = r.signing_context(BOB).await.unwrap();
        assert!(ctx.is_session());
        match ctx {
            SigningContext::SessionKey { private_key } => assert_eq!(private_key, "bob-sk"),
            other => panic!("unexpected context: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signer_never_used_for_foreign_actor() {
        // 登录身份有签名器，但目标 actor 不同且会话身份无法匹配
        let r = resolver(MockSession::new(Some(ALICE), Some((ALICE, "alice-sk"))), true);
        let err = r.signing_context(BOB).await.unwrap_err();
        assert_eq!(err.code(), "session-actor-mismatch");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_session_key() {
        let session = MockSession::new(None, None).with_session_without_key(BOB);
        let r = resolver(session, false);
        let err = r.signing_context(BOB).await.unwrap_err();
        assert_eq!(err, WatchHistoryError::MissingSessionKey);
    }

    #[test]
    fn test_decryption_context_never_ensures() {
        let r = resolver(MockSession::new(Some(ALICE), None).ensuring(BOB, "bob-sk"), true);
        assert!(matches!(r.decryption_context(ALICE), Some(SigningContext::Extension(_))));
        assert!(r.decryption_context(BOB).is_none());

        let r = resolver(MockSession::new(None, Some((BOB, "bob-sk"))), false);
        assert!(r.decryption_context(BOB).unwrap().is_session());
    }

    #[tokio::test]
    async fn test_no_session_provider() {
        let r = IdentityResolver::new(&Capabilities::new());
        let err = r.signing_context(BOB).await.unwrap_err();
        assert_eq!(err, WatchHistoryError::SessionActorMissing);
    }
}
