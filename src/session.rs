//! Channel envelopes and the per-request dispatch state machine.
//!
//! One `ChannelHandler` serves one caller's long-lived channel. Each request
//! envelope runs as its own cycle: resolve settings, classify the model,
//! acquire a credential if the family needs one, stream the provider's
//! output back, translate failures. Cycles on the same channel are not
//! serialized; a caller that sends a second request before the first
//! resolves gets interleaved responses, as the extension frontend expects.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::{BackendRegistry, DispatchError, GenerateContext, ModelFamily};
use crate::config::SettingsProvider;
use crate::credentials::CredentialCache;

/// One logical conversation turn. Created by the caller; the dispatcher only
/// fills in missing identifiers. Backend-specific continuation state
/// (`conversationId` and friends) rides along opaquely in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Fresh per request turn; assigned by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Generated once per conversation, then reused verbatim by the caller
    /// on every subsequent turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub question: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

/// Caller → dispatcher. An envelope without a session payload is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub session: Option<Session>,
}

/// Dispatcher → caller: either an opaque streamed answer event, relayed
/// untouched from the backend, or a terminal error for this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Error { error: String },
    Answer(serde_json::Value),
}

/// Outbound half of a channel, as seen by a provider. A send on a closed
/// channel is a cancellation, not an error worth reporting.
pub struct AnswerSink {
    tx: mpsc::Sender<ResponseEnvelope>,
}

impl AnswerSink {
    pub fn new(tx: mpsc::Sender<ResponseEnvelope>) -> Self {
        Self { tx }
    }

    /// Relay one streamed event to the caller.
    pub async fn relay(&self, event: serde_json::Value) -> Result<(), DispatchError> {
        self.tx
            .send(ResponseEnvelope::Answer(event))
            .await
            .map_err(|_| DispatchError::Cancelled)
    }
}

/// Serves one caller's channel for its whole lifetime.
pub struct ChannelHandler {
    credentials: Arc<CredentialCache>,
    registry: Arc<BackendRegistry>,
    settings: Arc<dyn SettingsProvider>,
}

impl ChannelHandler {
    pub fn new(
        credentials: Arc<CredentialCache>,
        registry: Arc<BackendRegistry>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            credentials,
            registry,
            settings,
        }
    }

    /// Receive request envelopes until the transport goes away, running each
    /// as an independent cycle. Dropping the request sender ends the loop
    /// and aborts every cycle still streaming.
    pub async fn serve(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<RequestEnvelope>,
        responses: mpsc::Sender<ResponseEnvelope>,
    ) {
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        while let Some(envelope) = requests.recv().await {
            let Some(session) = envelope.session else {
                log::debug!("request envelope without session payload, ignoring");
                continue;
            };

            in_flight.retain(|task| !task.is_finished());
            let handler = Arc::clone(&self);
            let responses = responses.clone();
            in_flight.push(tokio::spawn(async move {
                handler.run_cycle(session, responses).await;
            }));
        }

        // Transport closed: cancel whatever is still streaming.
        for task in in_flight {
            task.abort();
        }
    }

    /// One request/response cycle. All failures stop here; nothing escapes
    /// to take the process down.
    pub(crate) async fn run_cycle(
        &self,
        session: Session,
        responses: mpsc::Sender<ResponseEnvelope>,
    ) {
        let sink = AnswerSink::new(responses.clone());
        match self.dispatch(session, &sink).await {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {
                log::debug!("request cycle cancelled by caller");
            }
            Err(err) => {
                let message = err.to_string();
                log::error!("request cycle failed: {}", message);
                let _ = responses
                    .send(ResponseEnvelope::Error {
                        error: message,
                    })
                    .await;
                // Conservative policy: any unexplained failure forces
                // re-auth on the next web-session request, related or not.
                self.credentials.invalidate().await;
            }
        }
    }

    async fn dispatch(&self, mut session: Session, sink: &AnswerSink) -> Result<(), DispatchError> {
        // Live settings every cycle; an options change applies immediately.
        let settings = self.settings.current();
        let family = ModelFamily::classify(&settings.model_name);
        let provider = self
            .registry
            .get(family)
            .ok_or_else(|| DispatchError::UnsupportedModel(settings.model_name.clone()))?;

        let credential = if family.needs_credential() {
            let token = self.credentials.get().await?;
            session.message_id = Some(Uuid::new_v4().to_string());
            if session.parent_message_id.is_none() {
                session.parent_message_id = Some(Uuid::new_v4().to_string());
            }
            Some(token)
        } else {
            None
        };

        provider
            .generate(GenerateContext {
                session: &session,
                settings: &settings,
                credential: credential.as_deref(),
                sink,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::AnswerProvider;
    use crate::config::{Settings, StaticSettings};
    use crate::credentials::MockTokenSource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted provider that records what the handler hands it.
    struct FakeProvider {
        family: ModelFamily,
        script: Script,
        seen: Mutex<Vec<(Session, Option<String>)>>,
    }

    enum Script {
        Stream(Vec<serde_json::Value>),
        Fail(DispatchError),
    }

    impl FakeProvider {
        fn new(family: ModelFamily, script: Script) -> Arc<Self> {
            Arc::new(Self {
                family,
                script,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(Session, Option<String>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnswerProvider for FakeProvider {
        fn family(&self) -> ModelFamily {
            self.family
        }

        async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
            self.seen.lock().unwrap().push((
                ctx.session.clone(),
                ctx.credential.map(str::to_string),
            ));
            match &self.script {
                Script::Stream(events) => {
                    for event in events {
                        ctx.sink.relay(event.clone()).await?;
                    }
                    Ok(())
                }
                Script::Fail(err) => Err(err.clone()),
            }
        }
    }

    fn make_handler(
        provider: Arc<FakeProvider>,
        model_name: &str,
        source: MockTokenSource,
    ) -> (ChannelHandler, Arc<CredentialCache>) {
        let settings = Settings {
            model_name: model_name.to_string(),
            ..Settings::default()
        };
        let mut registry = BackendRegistry::new();
        registry.register(provider);
        let credentials = Arc::new(CredentialCache::new(Arc::new(source)));
        let handler = ChannelHandler::new(
            Arc::clone(&credentials),
            Arc::new(registry),
            Arc::new(StaticSettings(settings)),
        );
        (handler, credentials)
    }

    fn token_source(token: &str) -> MockTokenSource {
        let token = token.to_string();
        let mut source = MockTokenSource::new();
        source.expect_fetch().returning(move || Ok(token.clone()));
        source
    }

    // ── dispatching ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn web_session_cycle_fetches_credential_and_fills_ids() {
        let provider = FakeProvider::new(
            ModelFamily::WebSession,
            Script::Stream(vec![json!({"answer": "partial"})]),
        );
        let mut source = MockTokenSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Ok("tok".to_string()));
        let (handler, _) = make_handler(Arc::clone(&provider), "chatgpt-webapp", source);

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("why is the sky blue"), tx).await;

        let seen = provider.seen();
        assert_eq!(seen.len(), 1);
        let (session, credential) = &seen[0];
        assert_eq!(credential.as_deref(), Some("tok"));
        assert!(session.message_id.is_some());
        assert!(session.parent_message_id.is_some());

        assert_eq!(
            rx.recv().await,
            Some(ResponseEnvelope::Answer(json!({"answer": "partial"})))
        );
    }

    #[tokio::test]
    async fn parent_message_id_is_preserved_across_turns() {
        let provider = FakeProvider::new(ModelFamily::WebSession, Script::Stream(vec![]));
        let (handler, _) =
            make_handler(Arc::clone(&provider), "chatgpt-webapp", token_source("tok"));

        let mut first_turn = Session::new("first");
        first_turn.parent_message_id = Some("conversation-root".to_string());
        let (tx, _rx) = mpsc::channel(8);
        handler.run_cycle(first_turn, tx.clone()).await;
        handler.run_cycle(Session::new("second"), tx).await;

        let seen = provider.seen();
        assert_eq!(
            seen[0].0.parent_message_id.as_deref(),
            Some("conversation-root")
        );
        // A turn that omits the id gets a fresh one, not the previous one.
        let generated = seen[1].0.parent_message_id.as_deref().unwrap();
        assert!(!generated.is_empty());
        assert_ne!(generated, "conversation-root");
        // messageId is fresh every turn.
        assert_ne!(seen[0].0.message_id, seen[1].0.message_id);
    }

    #[tokio::test]
    async fn token_families_never_touch_the_credential_cache() {
        let provider = FakeProvider::new(ModelFamily::ChatCompletion, Script::Stream(vec![]));
        // No expectations: any fetch would panic the mock.
        let (handler, _) =
            make_handler(Arc::clone(&provider), "gpt-3.5-turbo", MockTokenSource::new());

        let (tx, _rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        let seen = provider.seen();
        assert_eq!(seen[0].1, None);
        // Identifiers are left alone for token families.
        assert!(seen[0].0.message_id.is_none());
    }

    #[tokio::test]
    async fn opaque_session_fields_reach_the_provider() {
        let provider = FakeProvider::new(ModelFamily::WebSession, Script::Stream(vec![]));
        let (handler, _) =
            make_handler(Arc::clone(&provider), "chatgpt-webapp", token_source("tok"));

        let mut session = Session::new("q");
        session
            .extra
            .insert("conversationId".to_string(), json!("conv-7"));
        let (tx, _rx) = mpsc::channel(8);
        handler.run_cycle(session, tx).await;

        assert_eq!(
            provider.seen()[0].0.extra.get("conversationId"),
            Some(&json!("conv-7"))
        );
    }

    // ── failure translation ──────────────────────────────────────────────

    #[tokio::test]
    async fn backend_failure_sends_envelope_and_invalidates_cache() {
        let provider = FakeProvider::new(
            ModelFamily::ChatCompletion,
            Script::Fail(DispatchError::Backend("rate limited".to_string())),
        );
        let (handler, credentials) =
            make_handler(Arc::clone(&provider), "gpt-3.5-turbo", token_source("tok"));

        // Populate the cache out-of-band: the conservative policy must
        // invalidate it even though this family never used it.
        credentials.get().await.unwrap();
        assert!(credentials.is_populated().await);

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(ResponseEnvelope::Error {
                error: "rate limited".to_string()
            })
        );
        assert!(!credentials.is_populated().await);
    }

    #[tokio::test]
    async fn cancellation_is_silent_and_leaves_cache_alone() {
        let provider = FakeProvider::new(
            ModelFamily::WebSession,
            Script::Fail(DispatchError::Cancelled),
        );
        let (handler, credentials) =
            make_handler(Arc::clone(&provider), "chatgpt-webapp", token_source("tok"));

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        assert_eq!(rx.recv().await, None);
        assert!(credentials.is_populated().await);
    }

    #[tokio::test]
    async fn abort_marked_backend_error_counts_as_cancellation() {
        let provider = FakeProvider::new(
            ModelFamily::WebSession,
            Script::Fail(DispatchError::Backend(
                "The operation was aborted".to_string(),
            )),
        );
        let (handler, credentials) =
            make_handler(Arc::clone(&provider), "chatgpt-webapp", token_source("tok"));

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        assert_eq!(rx.recv().await, None);
        assert!(credentials.is_populated().await);
    }

    #[tokio::test]
    async fn unknown_model_surfaces_unsupported_model() {
        let provider = FakeProvider::new(ModelFamily::ChatCompletion, Script::Stream(vec![]));
        let (handler, _) =
            make_handler(Arc::clone(&provider), "llama-70b", MockTokenSource::new());

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(ResponseEnvelope::Error {
                error: "UNSUPPORTED_MODEL: llama-70b".to_string()
            })
        );
        // The provider was never invoked.
        assert!(provider.seen().is_empty());
    }

    #[tokio::test]
    async fn blocked_credential_reaches_caller_as_cloudflare() {
        let provider = FakeProvider::new(ModelFamily::WebSession, Script::Stream(vec![]));
        let mut source = MockTokenSource::new();
        source
            .expect_fetch()
            .returning(|| Err(DispatchError::Blocked));
        let (handler, credentials) = make_handler(Arc::clone(&provider), "chatgpt-webapp", source);

        let (tx, mut rx) = mpsc::channel(8);
        handler.run_cycle(Session::new("q"), tx).await;

        assert_eq!(
            rx.recv().await,
            Some(ResponseEnvelope::Error {
                error: "CLOUDFLARE".to_string()
            })
        );
        assert!(!credentials.is_populated().await);
        assert!(provider.seen().is_empty());
    }

    // ── serve loop ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn envelope_without_session_is_ignored() {
        let provider = FakeProvider::new(
            ModelFamily::ChatCompletion,
            Script::Stream(vec![json!({"ok": true})]),
        );
        let (handler, _) =
            make_handler(Arc::clone(&provider), "gpt-3.5-turbo", MockTokenSource::new());

        let (req_tx, req_rx) = mpsc::channel(8);
        let (resp_tx, mut resp_rx) = mpsc::channel(8);
        let serve = tokio::spawn(Arc::new(handler).serve(req_rx, resp_tx));

        req_tx.send(RequestEnvelope::default()).await.unwrap();
        req_tx
            .send(RequestEnvelope {
                session: Some(Session::new("q")),
            })
            .await
            .unwrap();

        // Only the real request produced output; the empty envelope was
        // dropped without an error.
        assert_eq!(
            resp_rx.recv().await,
            Some(ResponseEnvelope::Answer(json!({"ok": true})))
        );
        drop(req_tx);
        serve.await.unwrap();
        assert_eq!(resp_rx.recv().await, None);
        assert_eq!(provider.seen().len(), 1);
    }

    #[tokio::test]
    async fn closing_the_channel_aborts_in_flight_cycles() {
        /// Provider that stalls forever before producing anything.
        struct StallingProvider {
            reached_end: Arc<std::sync::atomic::AtomicBool>,
        }

        #[async_trait]
        impl AnswerProvider for StallingProvider {
            fn family(&self) -> ModelFamily {
                ModelFamily::ChatCompletion
            }

            async fn generate(&self, _ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                self.reached_end
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let reached_end = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(StallingProvider {
            reached_end: Arc::clone(&reached_end),
        }));
        let settings = Settings {
            model_name: "gpt-3.5-turbo".to_string(),
            ..Settings::default()
        };
        let credentials = Arc::new(CredentialCache::new(Arc::new(MockTokenSource::new())));
        let handler = Arc::new(ChannelHandler::new(
            Arc::clone(&credentials),
            Arc::new(registry),
            Arc::new(StaticSettings(settings)),
        ));

        let (req_tx, req_rx) = mpsc::channel(8);
        let (resp_tx, mut resp_rx) = mpsc::channel(8);
        let serve = tokio::spawn(handler.serve(req_rx, resp_tx));

        req_tx
            .send(RequestEnvelope {
                session: Some(Session::new("q")),
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;

        // Caller goes away mid-stream.
        drop(req_tx);
        drop(resp_rx);
        serve.await.unwrap();

        assert!(!reached_end.load(std::sync::atomic::Ordering::SeqCst));
        // Nothing was sent and the cache was never touched.
        assert!(!credentials.is_populated().await);
    }

    // ── envelope wire shapes ─────────────────────────────────────────────

    #[test]
    fn request_envelope_parses_caller_json() {
        let envelope: RequestEnvelope = serde_json::from_str(
            r#"{"session": {"question": "hi", "parentMessageId": "p", "conversationId": "c"}}"#,
        )
        .unwrap();
        let session = envelope.session.unwrap();
        assert_eq!(session.question, "hi");
        assert_eq!(session.parent_message_id.as_deref(), Some("p"));
        assert_eq!(session.extra.get("conversationId"), Some(&json!("c")));

        let empty: RequestEnvelope = serde_json::from_str("{}").unwrap();
        assert!(empty.session.is_none());
    }

    #[test]
    fn error_envelope_serializes_to_error_object() {
        let envelope = ResponseEnvelope::Error {
            error: "CLOUDFLARE".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"error": "CLOUDFLARE"})
        );
    }
}
