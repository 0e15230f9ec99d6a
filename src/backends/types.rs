//! Core types and traits for the backend abstraction layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Settings;
use crate::session::{AnswerSink, Session};

/// Substring that marks a failure as caller-initiated. Transport layers and
/// upstream HTTP clients phrase aborts differently ("operation was aborted",
/// "request aborted"), but all of them contain this stem.
pub const ABORT_MARKER: &str = "abort";

/// Recoverable failure taxonomy of the dispatcher.
///
/// The display text of `Unauthorized` and `Blocked` is the literal code the
/// extension frontend matches on, so it must stay stable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No usable credential: missing config value, or the upstream session
    /// lacks a token.
    #[error("UNAUTHORIZED")]
    Unauthorized,
    /// The credential source refused the request (anti-automation edge).
    #[error("CLOUDFLARE")]
    Blocked,
    /// The caller aborted the request or closed the channel mid-flight.
    #[error("request aborted by caller")]
    Cancelled,
    /// The configured model key matches no known backend family.
    #[error("UNSUPPORTED_MODEL: {0}")]
    UnsupportedModel(String),
    /// Anything else a generation capability reports, surfaced verbatim.
    #[error("{0}")]
    Backend(String),
}

impl DispatchError {
    /// True for failures that must never reach the caller: explicit
    /// cancellations, and backend errors whose message carries the abort
    /// marker (an in-flight fetch torn down by a closing channel reports
    /// itself this way).
    pub fn is_cancellation(&self) -> bool {
        match self {
            DispatchError::Cancelled => true,
            DispatchError::Backend(message) => message.contains(ABORT_MARKER),
            _ => false,
        }
    }

    /// Wrap an upstream client error, preserving its message text.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        DispatchError::Backend(err.to_string())
    }
}

/// Model keys served by the web-session chat service.
const WEB_SESSION_MODELS: &[&str] = &["chatgpt-webapp"];

/// Model keys served by the plain completions API.
const COMPLETION_MODELS: &[&str] = &[
    "text-davinci-003",
    "text-davinci-002",
    "text-curie-001",
    "text-babbage-001",
    "text-ada-001",
];

/// Model keys served by the chat-completions API.
const CHAT_COMPLETION_MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-0301",
    "gpt-4",
    "gpt-4-0314",
    "gpt-4-32k",
    "gpt-4-32k-0314",
];

/// Model keys routed to the user-supplied endpoint.
const CUSTOM_MODELS: &[&str] = &["custom"];

/// Disjoint backend families a model key classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    WebSession,
    Completion,
    ChatCompletion,
    Custom,
    Unknown,
}

impl ModelFamily {
    /// Classify a configured model key. Pure lookup against the fixed
    /// membership lists; an unrecognized key is `Unknown`, never a default.
    pub fn classify(model_key: &str) -> ModelFamily {
        if WEB_SESSION_MODELS.contains(&model_key) {
            ModelFamily::WebSession
        } else if COMPLETION_MODELS.contains(&model_key) {
            ModelFamily::Completion
        } else if CHAT_COMPLETION_MODELS.contains(&model_key) {
            ModelFamily::ChatCompletion
        } else if CUSTOM_MODELS.contains(&model_key) {
            ModelFamily::Custom
        } else {
            ModelFamily::Unknown
        }
    }

    /// Whether requests for this family go through the credential cache.
    /// The token-API families carry their own key in settings instead.
    pub fn needs_credential(&self) -> bool {
        matches!(self, ModelFamily::WebSession)
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelFamily::WebSession => "web-session",
            ModelFamily::Completion => "completion",
            ModelFamily::ChatCompletion => "chat-completion",
            ModelFamily::Custom => "custom",
            ModelFamily::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Everything a provider needs for one generation call.
///
/// `session` already has its identifiers filled in by the channel handler;
/// `credential` is set only for families that need one.
pub struct GenerateContext<'a> {
    pub session: &'a Session,
    pub settings: &'a Settings,
    pub credential: Option<&'a str>,
    pub sink: &'a AnswerSink,
}

/// An answer-generation capability for one backend family.
///
/// Implementations stream whatever the upstream API emits into the sink
/// without reshaping it; the dispatcher is a transparent relay.
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// The family this provider serves.
    fn family(&self) -> ModelFamily;

    /// Drive one generation call to completion, relaying streamed events
    /// into `ctx.sink`. Long-running; cancelled by aborting the cycle task.
    async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError>;
}

/// Registry pairing each backend family with its generation capability.
pub struct BackendRegistry {
    providers: HashMap<ModelFamily, Arc<dyn AnswerProvider>>,
}

impl BackendRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registers a provider under its own family.
    pub fn register(&mut self, provider: Arc<dyn AnswerProvider>) {
        self.providers.insert(provider.family(), provider);
    }

    /// Gets the provider for a family, if one is registered. `Unknown` is
    /// never registered, so it always resolves to `None`.
    pub fn get(&self, family: ModelFamily) -> Option<Arc<dyn AnswerProvider>> {
        self.providers.get(&family).cloned()
    }

    /// Returns all registered families.
    #[allow(dead_code)]
    pub fn available_families(&self) -> Vec<ModelFamily> {
        self.providers.keys().copied().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
