//! 外部能力集合
//!
//! 宿主平台注入的能力在构造时一次性收集，可选能力用 `Option` 表示，
//! 调用路径上不再逐次探测。

use std::sync::Arc;

use crate::crypto::{ActiveSigner, KeyToolkit};
use crate::identity::SessionProvider;
use crate::network::{IdentifierDecoder, RelayDirectory, RelayTransport};

#[derive(Clone, Default)]
pub struct Capabilities {
    pub transport: Option<Arc<dyn RelayTransport>>,
    pub signer: Option<Arc<dyn ActiveSigner>>,
    pub toolkit: Option<Arc<dyn KeyToolkit>>,
    pub session: Option<Arc<dyn SessionProvider>>,
    pub relays: Option<Arc<dyn RelayDirectory>>,
    pub decoder: Option<Arc<dyn IdentifierDecoder>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Arc<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn ActiveSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_toolkit(mut self, toolkit: Arc<dyn KeyToolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_relays(mut self, relays: Arc<dyn RelayDirectory>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn IdentifierDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("transport", &self.transport.is_some())
            .field("signer", &self.signer.is_some())
            .field("toolkit", &self.toolkit.is_some())
            .field("session", &self.session.is_some())
            .field("relays", &self.relays.is_some())
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}
