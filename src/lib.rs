//! Background session dispatcher for the chatrelay browser extension.
//!
//! Content scripts open a long-lived channel, send question envelopes, and
//! receive streamed answer events back on the same channel. The dispatcher
//! classifies the configured model into a backend family, acquires the
//! credential that family needs, and relays the backend's stream without
//! interpreting it. Context-menu construction and one-shot messages are
//! thin glue around that core.

mod backends;
mod config;
mod credentials;
mod menu;
mod session;

use std::sync::Arc;
use tokio::sync::mpsc;

pub use backends::{
    default_registry, AnswerProvider, BackendRegistry, DispatchError, GenerateContext,
    ModelFamily,
};
pub use config::{Settings, SettingsProvider, StaticSettings, MENU_TOOLS};
pub use credentials::{
    ConfigTokenSource, CredentialCache, SessionTokenSource, TokenSource, CREDENTIAL_TTL,
};
pub use menu::{MenuError, MenuItem, MenuItemKind, MenuRelay, MenuTree, OneShotMessage};
pub use session::{AnswerSink, ChannelHandler, RequestEnvelope, ResponseEnvelope, Session};

/// Buffered envelopes per channel direction before senders await.
const CHANNEL_CAPACITY: usize = 32;

/// How the process can obtain the web-session credential.
pub enum Environment {
    /// No ambient cookie session; the token must come from settings.
    Standalone,
    /// The browser shares the chat service's cookies; the token comes from
    /// the upstream session endpoint.
    CookieSession,
}

/// The background coordination layer, constructed once per process.
///
/// Owns the credential cache, the backend registry, and the menu relay, and
/// opens one channel per caller.
pub struct Dispatcher {
    credentials: Arc<CredentialCache>,
    registry: Arc<BackendRegistry>,
    settings: Arc<dyn SettingsProvider>,
    relay: MenuRelay,
}

impl Dispatcher {
    /// Wire up the default providers and the credential source matching the
    /// execution environment.
    pub fn new(settings: Arc<dyn SettingsProvider>, environment: Environment) -> Self {
        let client = reqwest::Client::new();
        let source: Arc<dyn TokenSource> = match environment {
            Environment::Standalone => Arc::new(ConfigTokenSource::new(Arc::clone(&settings))),
            Environment::CookieSession => Arc::new(SessionTokenSource::new(client.clone())),
        };
        let registry = Arc::new(default_registry(client.clone()));
        Self::with_parts(settings, source, registry, client)
    }

    /// Full injection constructor; what tests and embedders with custom
    /// providers use.
    pub fn with_parts(
        settings: Arc<dyn SettingsProvider>,
        source: Arc<dyn TokenSource>,
        registry: Arc<BackendRegistry>,
        client: reqwest::Client,
    ) -> Self {
        let credentials = Arc::new(CredentialCache::new(source));
        let relay = MenuRelay::new(
            Arc::clone(&settings),
            Arc::clone(&credentials),
            client,
        );
        Self {
            credentials,
            registry,
            settings,
            relay,
        }
    }

    /// Open a channel for one caller. The returned sender/receiver pair is
    /// the caller's half; dropping either half closes the channel and
    /// cancels whatever is still streaming.
    pub fn open_channel(
        &self,
    ) -> (
        mpsc::Sender<RequestEnvelope>,
        mpsc::Receiver<ResponseEnvelope>,
    ) {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handler = Arc::new(ChannelHandler::new(
            Arc::clone(&self.credentials),
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
        ));
        tokio::spawn(handler.serve(request_rx, response_tx));
        (request_tx, response_rx)
    }

    /// Route an extension-wide one-shot message. `CREATE_MENU` is outbound
    /// only and ignored here.
    pub async fn handle_message(&self, message: OneShotMessage) {
        match message {
            OneShotMessage::Feedback(payload) => self.relay.forward_feedback(payload).await,
            OneShotMessage::RefreshMenu => {
                if let Err(err) = self.relay.rebuild() {
                    log::error!("menu rebuild failed: {}", err);
                }
            }
            OneShotMessage::CreateMenu { .. } => {
                log::debug!("ignoring outbound-only CREATE_MENU message");
            }
        }
    }

    /// The menu relay, for click routing and startup menu construction.
    pub fn menu(&self) -> &MenuRelay {
        &self.relay
    }

    /// The process-wide credential cache.
    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }
}
