//! 测试辅助：内存 relay、可逆的伪加密工具、会话提供者

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::{DecodedIdentifier, Filter, IdentifierDecoder, Record, RecordStream, RelayDirectory, RelayTransport, UnsignedRecord};
use crate::crypto::{ActiveSigner, EncryptionScheme, KeyToolkit};
use crate::error::{Result, WatchHistoryError};
use crate::identity::{SessionActor, SessionProvider};

pub const ALICE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const BOB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// 初始化测试日志（重复调用无副作用）
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn record_id(record: &UnsignedRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.pubkey.as_bytes());
    hasher.update(record.created_at.to_be_bytes());
    hasher.update(record.kind.to_be_bytes());
    for tag in &record.tags {
        hasher.update(tag.join("\u{1f}").as_bytes());
    }
    hasher.update(record.content.as_bytes());
    hex::encode(hasher.finalize())
}

fn finish(record: UnsignedRecord, sig: String) -> Record {
    Record {
        id: record_id(&record),
        pubkey: record.pubkey,
        created_at: record.created_at,
        kind: record.kind,
        tags: record.tags,
        content: record.content,
        sig,
    }
}

fn fake_encrypt(scheme: EncryptionScheme, plaintext: &str) -> String {
    let body = hex::encode(plaintext.as_bytes());
    match scheme {
        EncryptionScheme::Nip44V2 => format!("n44v2:{}", body),
        EncryptionScheme::Nip44 => format!("n44:{}", body),
        EncryptionScheme::Nip04 => format!("{}?iv=aXY=", body),
    }
}

fn fake_decrypt(scheme: EncryptionScheme, ciphertext: &str) -> Result<String> {
    let body = match scheme {
        EncryptionScheme::Nip44V2 => ciphertext.strip_prefix("n44v2:"),
        EncryptionScheme::Nip44 => ciphertext.strip_prefix("n44:"),
        EncryptionScheme::Nip04 => ciphertext.strip_suffix("?iv=aXY="),
    }
    .ok_or_else(|| WatchHistoryError::DecryptionFailed(format!("{} 格式不匹配", scheme.as_tag())))?;
    let bytes = hex::decode(body).map_err(|e| WatchHistoryError::DecryptionFailed(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| WatchHistoryError::DecryptionFailed(e.to_string()))
}

/// 内存 relay 集合
#[derive(Default)]
pub struct MockRelayTransport {
    stored: Mutex<HashMap<String, Vec<Record>>>,
    rejecting: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
    ignore_authors: AtomicBool,
    list_delay: Mutex<Option<Duration>>,
    publish_calls: AtomicUsize,
    list_calls: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::Sender<Record>>>,
}

impl MockRelayTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 让某个 relay 拒绝所有发布
    pub fn reject(&self, relay: &str) {
        self.rejecting.lock().insert(relay.to_string());
    }

    pub fn accept_all(&self) {
        self.rejecting.lock().clear();
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// 模拟不遵守 authors 条件的 relay
    pub fn ignore_authors(&self, ignore: bool) {
        self.ignore_authors.store(ignore, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock() = Some(delay);
    }

    pub fn publish_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self, relay: &str) -> Vec<Record> {
        self.stored.lock().get(relay).cloned().unwrap_or_default()
    }

    /// 直接写入 relay，不计入发布次数
    pub fn seed(&self, relay: &str, record: Record) {
        Self::store(&mut self.stored.lock(), relay, record);
    }

    fn store(stored: &mut HashMap<String, Vec<Record>>, relay: &str, record: Record) {
        let records = stored.entry(relay.to_string()).or_default();
        // 可寻址记录按 (pubkey, kind, d) 替换旧版本
        if let Some(identifier) = record.identifier().map(String::from) {
            records.retain(|existing| {
                !(existing.pubkey == record.pubkey
                    && existing.kind == record.kind
                    && existing.identifier() == Some(identifier.as_str())
                    && existing.created_at <= record.created_at)
            });
        }
        records.push(record);
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn publish(&self, relay: &str, record: &Record) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.lock().contains(relay) {
            return Err(WatchHistoryError::Transport(format!("{} rejected", relay)));
        }
        Self::store(&mut self.stored.lock(), relay, record.clone());
        self.subscribers
            .lock()
            .retain(|sender| sender.try_send(record.clone()).is_ok());
        Ok(())
    }

    async fn list(&self, relays: &[String], filters: &[Filter]) -> Result<Vec<Record>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(WatchHistoryError::Transport("list failed".to_string()));
        }
        let filters: Vec<Filter> = if self.ignore_authors.load(Ordering::SeqCst) {
            filters
                .iter()
                .cloned()
                .map(|mut f| {
                    f.authors.clear();
                    f
                })
                .collect()
        } else {
            filters.to_vec()
        };
        let stored = self.stored.lock();
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for relay in relays {
            for record in stored.get(relay).into_iter().flatten() {
                if filters.iter().any(|f| f.matches(record)) && seen.insert(record.id.clone()) {
                    results.push(record.clone());
                }
            }
        }
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    async fn subscribe(&self, _relays: &[String], _filters: &[Filter]) -> Result<Option<RecordStream>> {
        let (tx, rx) = mpsc::channel(32);
        self.subscribers.lock().push(tx);
        Ok(Some(rx))
    }
}

/// 基于私钥的伪密码学工具
pub struct MockToolkit {
    schemes: HashSet<EncryptionScheme>,
}

impl MockToolkit {
    pub fn new() -> Self {
        Self::with_schemes(&[
            EncryptionScheme::Nip44V2,
            EncryptionScheme::Nip44,
            EncryptionScheme::Nip04,
        ])
    }

    pub fn with_schemes(schemes: &[EncryptionScheme]) -> Self {
        Self {
            schemes: schemes.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl KeyToolkit for MockToolkit {
    fn supports(&self, scheme: EncryptionScheme) -> bool {
        self.schemes.contains(&scheme)
    }

    async fn encrypt(&self, scheme: EncryptionScheme, _private_key: &str, _peer: &str, plaintext: &str) -> Result<String> {
        Ok(fake_encrypt(scheme, plaintext))
    }

    async fn decrypt(&self, scheme: EncryptionScheme, _private_key: &str, _peer: &str, ciphertext: &str) -> Result<String> {
        fake_decrypt(scheme, ciphertext)
    }

    async fn sign_with_key(&self, record: UnsignedRecord, private_key: &str) -> Result<Record> {
        Ok(finish(record, format!("key-sig:{}", private_key)))
    }
}

/// 交互式签名器
pub struct MockSigner {
    pubkey: String,
    fail_sign: AtomicBool,
}

impl MockSigner {
    pub fn new(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            fail_sign: AtomicBool::new(false),
        }
    }

    pub fn fail_signing(&self, fail: bool) {
        self.fail_sign.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActiveSigner for MockSigner {
    async fn sign_record(&self, record: UnsignedRecord) -> Result<Record> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(WatchHistoryError::SigningFailed("用户拒绝签名".to_string()));
        }
        Ok(finish(record, format!("ext-sig:{}", self.pubkey)))
    }

    fn supports(&self, scheme: EncryptionScheme) -> bool {
        matches!(scheme, EncryptionScheme::Nip44V2 | EncryptionScheme::Nip04)
    }

    async fn encrypt(&self, scheme: EncryptionScheme, _peer: &str, plaintext: &str) -> Result<String> {
        Ok(fake_encrypt(scheme, plaintext))
    }

    async fn decrypt(&self, scheme: EncryptionScheme, _peer: &str, ciphertext: &str) -> Result<String> {
        fake_decrypt(scheme, ciphertext)
    }
}

#[derive(Default)]
struct SessionState {
    logged: Option<String>,
    session: Option<SessionActor>,
    ensure_to: Option<SessionActor>,
}

/// 会话提供者
#[derive(Default)]
pub struct MockSession {
    state: Mutex<SessionState>,
}

impl MockSession {
    pub fn new(logged: Option<&str>, session: Option<(&str, &str)>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                logged: logged.map(String::from),
                session: session.map(|(pubkey, key)| SessionActor {
                    pubkey: pubkey.to_string(),
                    private_key: Some(key.to_string()),
                }),
                ensure_to: None,
            }),
        }
    }

    /// `ensure_session_actor` 时切换到指定会话身份
    pub fn ensuring(self, pubkey: &str, private_key: &str) -> Self {
        self.state.lock().ensure_to = Some(SessionActor {
            pubkey: pubkey.to_string(),
            private_key: Some(private_key.to_string()),
        });
        self
    }

    pub fn with_session_without_key(self, pubkey: &str) -> Self {
        self.state.lock().session = Some(SessionActor {
            pubkey: pubkey.to_string(),
            private_key: None,
        });
        self
    }

    pub fn set_logged(&self, logged: Option<&str>) {
        self.state.lock().logged = logged.map(String::from);
    }
}

#[async_trait]
impl SessionProvider for MockSession {
    fn logged_pubkey(&self) -> Option<String> {
        self.state.lock().logged.clone()
    }

    fn session_actor(&self) -> Option<SessionActor> {
        self.state.lock().session.clone()
    }

    async fn ensure_session_actor(&self) -> Result<Option<String>> {
        let mut state = self.state.lock();
        if let Some(target) = state.ensure_to.clone() {
            state.session = Some(target);
        }
        Ok(state.session.as_ref().map(|s| s.pubkey.clone()))
    }
}

/// 解码 `npub1<hex>` / `nevent1<id>`
pub struct MockDecoder;

impl IdentifierDecoder for MockDecoder {
    fn decode(&self, value: &str) -> Option<DecodedIdentifier> {
        if let Some(pubkey) = value.strip_prefix("npub1") {
            return Some(DecodedIdentifier::Pubkey(pubkey.to_string()));
        }
        if let Some(id) = value.strip_prefix("nevent1") {
            return Some(DecodedIdentifier::Event {
                id: id.to_string(),
                relays: Vec::new(),
            });
        }
        None
    }
}

/// 固定的 relay 目录
pub struct MockDirectory {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl MockDirectory {
    pub fn new(relays: &[&str]) -> Self {
        let relays: Vec<String> = relays.iter().map(|r| r.to_string()).collect();
        Self {
            read: relays.clone(),
            write: relays,
        }
    }
}

impl RelayDirectory for MockDirectory {
    fn read_relays(&self) -> Vec<String> {
        self.read.clone()
    }

    fn write_relays(&self) -> Vec<String> {
        self.write.clone()
    }
}
